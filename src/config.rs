use crate::directory::{BindCredential, DirectoryConfig};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::ldap_protocol::Attribute;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Default upper bound for one LDAP PDU.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    /// Naming contexts served by the directory.
    #[serde(default = "default_base_dn")]
    pub base_dn: Vec<String>,
    /// Extra bind identity that is not stored as an entry.
    pub credential: Option<CredentialConfig>,
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Allow operations other than bind and root DSE reads without binding first (default true).
    pub allow_anonymous: Option<bool>,
    /// Server-side cap on search results; 0 or absent means unlimited.
    pub size_limit: Option<usize>,
    /// Maximum accepted PDU size in bytes (default 16 MiB).
    pub max_message_size: Option<usize>,
    pub tls: Option<TlsConfig>,
    /// Optional HTTP listen address for metrics and health (e.g. "127.0.0.1:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
    /// Entries loaded into the directory at startup.
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
    #[serde(default)]
    pub interceptors: InterceptorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub enabled: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// CA bundle for verifying client certificates (optional).
    pub ca_file: Option<String>,
}

/// A single value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(v) => vec![v.as_str()],
            OneOrMany::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub dn: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, OneOrMany>,
}

impl EntryConfig {
    pub fn to_entry(&self) -> Result<Entry> {
        let dn = Dn::parse(&self.dn)?;
        let attributes = self
            .attributes
            .iter()
            .map(|(name, values)| Attribute::from_strs(name, &values.values()))
            .collect();
        Entry::from_attributes(dn, attributes).with_context(|| format!("Invalid entry {}", self.dn))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Canned entries returned for base searches on their DN without touching the directory.
    #[serde(default)]
    pub static_entries: Vec<EntryConfig>,
    /// Log every request, entry and result at debug level.
    #[serde(default)]
    pub log_operations: bool,
}

fn default_base_dn() -> Vec<String> {
    vec!["dc=example,dc=com".to_string()]
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Read config file {:?}", path))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous.unwrap_or(true)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Cert and key paths. A `tls` section must name both or neither.
    pub fn tls_files(&self) -> Result<Option<crate::tls::TlsFiles>> {
        let Some(tls) = self.tls.as_ref() else {
            return Ok(None);
        };
        match (&tls.cert_file, &tls.key_file) {
            (Some(cert_file), Some(key_file)) => Ok(Some(crate::tls::TlsFiles {
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
                ca_file: tls.ca_file.clone(),
            })),
            (None, None) if tls.ca_file.is_none() => Ok(None),
            (Some(_), None) => bail!("tls.cert_file is set but tls.key_file is missing"),
            (None, Some(_)) => bail!("tls.key_file is set but tls.cert_file is missing"),
            (None, None) => bail!("tls.ca_file requires tls.cert_file and tls.key_file"),
        }
    }

    pub fn directory_config(&self) -> DirectoryConfig {
        let credentials = self
            .credential
            .iter()
            .filter(|c| !c.username.trim().is_empty() && !c.password.is_empty())
            .map(|c| BindCredential {
                dn: c.username.clone(),
                password: c.password.clone(),
            })
            .collect();
        DirectoryConfig {
            base_dns: self.base_dn.clone(),
            schema_validation: self.validation.enabled,
            size_limit: self.size_limit.unwrap_or(0),
            credentials,
        }
    }

    pub fn fixture_entries(&self) -> Result<Vec<Entry>> {
        self.entries.iter().map(EntryConfig::to_entry).collect()
    }

    pub fn static_entries(&self) -> Result<Vec<Entry>> {
        self.interceptors.static_entries.iter().map(EntryConfig::to_entry).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            base_dn: default_base_dn(),
            credential: None,
            validation: ValidationConfig::default(),
            allow_anonymous: Some(true),
            size_limit: None,
            max_message_size: None,
            tls: None,
            metrics_listen: None,
            entries: Vec::new(),
            interceptors: InterceptorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:1389");
        assert_eq!(config.base_dn, vec!["dc=example,dc=com".to_string()]);
        assert!(config.validation.enabled);
        assert!(config.allow_anonymous());
        assert_eq!(config.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.tls_files().unwrap().is_none());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
listen:
  url: "ldap://0.0.0.0:1389"
base_dn:
  - "dc=ldap,dc=com"
credential:
  username: "cn=admin,dc=ldap,dc=com"
  password: "secret"
validation:
  enabled: false
allow_anonymous: false
size_limit: 100
max_message_size: 65536
tls:
  cert_file: "/path/to/cert.pem"
  key_file: "/path/to/key.pem"
metrics_listen: "127.0.0.1:9090"
entries:
  - dn: "uid=jahn,ou=people,dc=ldap,dc=com"
    attributes:
      objectclass: [top, person, organizationalPerson, inetOrgPerson]
      cn: "Jahn Dae"
      sn: "Jahn"
interceptors:
  log_operations: true
  static_entries:
    - dn: "uid=static,dc=ldap,dc=com"
      attributes:
        uid: static
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://0.0.0.0:1389");
        assert!(!config.allow_anonymous());
        assert_eq!(config.max_message_size(), 65536);
        assert_eq!(config.metrics_listen.as_deref(), Some("127.0.0.1:9090"));

        let dir = config.directory_config();
        assert_eq!(dir.base_dns, vec!["dc=ldap,dc=com".to_string()]);
        assert!(!dir.schema_validation);
        assert_eq!(dir.size_limit, 100);
        assert_eq!(dir.credentials.len(), 1);
        assert_eq!(dir.credentials[0].dn, "cn=admin,dc=ldap,dc=com");

        let tls = config.tls_files().unwrap().unwrap();
        assert_eq!(tls.cert_file, "/path/to/cert.pem");
        assert!(tls.ca_file.is_none());

        let entries = config.fixture_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].values("objectClass").len(), 4);
        assert_eq!(entries[0].first_str("cn"), Some("Jahn Dae"));

        assert!(config.interceptors.log_operations);
        let statics = config.static_entries().unwrap();
        assert_eq!(statics[0].first_str("uid"), Some("static"));
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://:1389");
        assert_eq!(config.base_dn, vec!["dc=example,dc=com".to_string()]);
        assert!(config.entries.is_empty());
        assert!(!config.interceptors.log_operations);
        assert!(config.directory_config().credentials.is_empty());
    }

    #[test]
    fn test_blank_credential_ignored() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
credential:
  username: ""
  password: "x"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(config.directory_config().credentials.is_empty());
    }

    #[test]
    fn test_incomplete_tls_pair_rejected() {
        let only_cert = r#"
listen:
  url: "ldap://:1389"
tls:
  cert_file: "/path/to/cert.pem"
"#;
        let err = Config::from_str(only_cert).unwrap().tls_files().unwrap_err();
        assert!(err.to_string().contains("tls.key_file is missing"));

        let only_key = r#"
listen:
  url: "ldap://:1389"
tls:
  key_file: "/path/to/key.pem"
"#;
        assert!(Config::from_str(only_key).unwrap().tls_files().is_err());

        let only_ca = r#"
listen:
  url: "ldap://:1389"
tls:
  ca_file: "/path/to/ca.pem"
"#;
        assert!(Config::from_str(only_ca).unwrap().tls_files().is_err());

        let empty = r#"
listen:
  url: "ldap://:1389"
tls: {}
"#;
        assert!(Config::from_str(empty).unwrap().tls_files().unwrap().is_none());
    }

    #[test]
    fn test_bad_fixture_dn() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
entries:
  - dn: "not a dn"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(config.fixture_entries().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:1389"
base_dn: ["dc=ldap,dc=com", "o=test"]
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.base_dn.len(), 2);
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.yaml")).unwrap();
        assert_eq!(config.fixture_entries().unwrap().len(), 2);
        assert_eq!(config.static_entries().unwrap().len(), 1);
        assert!(config.tls_files().unwrap().is_none());
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        assert!(Config::from_str("invalid: yaml: content: [").is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }
}
