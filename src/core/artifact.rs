//! The host-side objects that steps create and manage.

/// A rendered configuration file bound for a path on a target host.
///
/// Artifacts are created transiently per publish: the content is rendered on the
/// control node, written to the destination (overwriting whatever was there, with no
/// backup), and forgotten. Ownership is set after the write, and the permission mode
/// after ownership; the first failing sub-step aborts the rest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artifact {
    /// The rendered file content.
    pub content: String,

    /// The destination path on the host.
    pub dest: String,

    /// The owning user.
    pub owner: String,

    /// The owning group.
    pub group: String,

    /// The octal permission mode, e.g. `600`.
    pub mode: String,

    /// Whether installing requires host-administrator privilege.
    pub elevated: bool,
}

/// A long-running service under the host's supervision facility.
///
/// The descriptor carries no state of its own; whether the service is absent, stopped,
/// or running lives on the host, and the lifecycle steps never query it before acting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceDescriptor {
    /// The init unit name, e.g. `app-server`.
    pub name: String,

    /// Where the service writes its log.
    pub log: String,
}

/// TLS material for one domain.
///
/// The bundle has a two-phase lifecycle keyed off remote file existence: on a host
/// with no signing request, the key and CSR are created and the task halts for the
/// certificate authority's out-of-band signature; once the signed certificate has
/// been placed next to them, a re-run tightens permissions on the key and
/// certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateBundle {
    /// The domain the certificate is for.
    pub domain: String,

    /// The private key path.
    pub key: String,

    /// The certificate signing request path.
    pub csr: String,

    /// The signed certificate path.
    pub certificate: String,
}

impl CertificateBundle {
    /// The conventional paths for `domain` under `ssl_dir`.
    pub fn for_domain(ssl_dir: &str, domain: &str) -> Self {
        CertificateBundle {
            domain: domain.to_owned(),
            key: format!("{ssl_dir}/{domain}.key"),
            csr: format!("{ssl_dir}/{domain}.csr"),
            certificate: format!("{ssl_dir}/{domain}.crt"),
        }
    }
}
