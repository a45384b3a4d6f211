/// TLS material resolved at snapshot-build time. The listener itself (cert
/// loading, SNI wiring) is out of scope here (spec §1); this only carries
/// what the handler needs to answer "is mTLS configured at all".
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_file: String,
    pub key_file: String,
    /// Presence is what "client CA configured" means for §4.1 step 5.
    pub client_ca_file: Option<String>,
}

impl TlsMaterial {
    pub fn has_client_ca(&self) -> bool {
        self.client_ca_file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_client_ca_reflects_presence() {
        let with_ca = TlsMaterial {
            cert_file: "c".into(),
            key_file: "k".into(),
            client_ca_file: Some("ca".into()),
        };
        assert!(with_ca.has_client_ca());

        let without_ca = TlsMaterial {
            cert_file: "c".into(),
            key_file: "k".into(),
            client_ca_file: None,
        };
        assert!(!without_ca.has_client_ca());
    }
}
