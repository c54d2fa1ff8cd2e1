use crate::error::ValidationError;
use regex::Regex;
use std::sync::OnceLock;

const DNS1123_LABEL_MAX_LENGTH: usize = 63;
const DNS1123_LABEL_REGEX: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
const FQDN_MAX_LENGTH: usize = 255;
const TAG_REGEX: &str = r"^[-A-Za-z0-9_./]*$";
const MESSAGE_NAME_REGEX: &str = r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)*$";

fn dns1123_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DNS1123_LABEL_REGEX).expect("label regex must compile"))
}

fn tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TAG_REGEX).expect("tag regex must compile"))
}

fn message_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(MESSAGE_NAME_REGEX).expect("message regex must compile"))
}

/// Tests for a string that conforms to the definition of a label in DNS (RFC
/// 1123).
pub fn is_dns1123_label(value: &str) -> bool {
    value.len() <= DNS1123_LABEL_MAX_LENGTH && dns1123_label().is_match(value)
}

/// Checks a fully-qualified domain name: at most 255 characters and every
/// dot-separated label a DNS-1123 label.
pub fn validate_fqdn(fqdn: &str) -> Result<(), ValidationError> {
    if fqdn.is_empty() {
        return Err("empty domain name not allowed".into());
    }
    if fqdn.len() > FQDN_MAX_LENGTH {
        return Err(format!("domain name {fqdn:?} too long (max {FQDN_MAX_LENGTH})").into());
    }

    let mut errs = ValidationError::default();
    for label in fqdn.split('.') {
        if !is_dns1123_label(label) {
            errs.push(format!(
                "domain name {fqdn:?} invalid (label {label:?} invalid)"
            ));
        }
    }
    errs.into_result()
}

pub fn is_tag_part(value: &str) -> bool {
    tag().is_match(value)
}

pub fn is_message_name(value: &str) -> bool {
    message_name().is_match(value)
}

pub fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err("port number 0 is out of range".into());
    }
    Ok(())
}

pub fn validate_percent(what: &str, percent: f64) -> Result<(), ValidationError> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(format!("{what} percentage {percent} must be in range 0..100").into());
    }
    Ok(())
}
