use crate::resources::{Cluster, ClusterSslContext, ListenerSslContext};
use pilot_core::ServiceAccounts;
use pilot_model::mesh::{CERT_CHAIN_FILENAME, KEY_FILENAME, ROOT_CERT_FILENAME};
use pilot_model::MeshConfig;

pub(crate) fn cert_path(dir: &str, file: &str) -> String {
    format!("{}/{file}", dir.trim_end_matches('/'))
}

/// Requires peers to present a certificate signed by the mesh root.
pub(crate) fn listener_tls(mesh: &MeshConfig) -> ListenerSslContext {
    ListenerSslContext {
        cert_chain_file: cert_path(&mesh.auth_certs_path, CERT_CHAIN_FILENAME),
        private_key_file: cert_path(&mesh.auth_certs_path, KEY_FILENAME),
        ca_cert_file: Some(cert_path(&mesh.auth_certs_path, ROOT_CERT_FILENAME)),
        require_client_certificate: true,
    }
}

/// Sets a client TLS context on clusters of mesh services, verifying the
/// upstream against the service accounts that run the destination.
pub(crate) fn apply_client_tls(
    mesh: &MeshConfig,
    accounts: &dyn ServiceAccounts,
    cluster: &mut Cluster,
) {
    let Some(upstream) = &cluster.upstream else {
        return;
    };
    let sans =
        accounts.get_istio_service_accounts(&upstream.hostname, &[upstream.port.name.clone()]);
    cluster.ssl_context = Some(ClusterSslContext {
        cert_chain_file: cert_path(&mesh.auth_certs_path, CERT_CHAIN_FILENAME),
        private_key_file: cert_path(&mesh.auth_certs_path, KEY_FILENAME),
        ca_cert_file: cert_path(&mesh.auth_certs_path, ROOT_CERT_FILENAME),
        verify_subject_alt_name: sans,
    });
}
