use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, LazyLock},
};

use data_model::POSTGRES_BACKEND;
use futures::future::BoxFuture;
use tracing::info;

use crate::{objects, postgres::PostgresBackend, swift, Backend, BlobError, BlobResult};

const ENV_PREFIX: &str = "BACKEND_";

pub type BackendConstructor =
    fn(String, BackendOptions) -> BoxFuture<'static, BlobResult<Arc<dyn Backend>>>;

static CONSTRUCTORS: LazyLock<HashMap<&'static str, BackendConstructor>> = LazyLock::new(|| {
    let mut m: HashMap<&'static str, BackendConstructor> = HashMap::new();
    m.insert("s3", objects::construct_s3);
    m.insert("gcs", objects::construct_gcs);
    m.insert("azure", objects::construct_azure);
    m.insert("file", objects::construct_local);
    m.insert("swift", swift::construct);
    m
});

pub fn constructor(kind: &str) -> Option<BackendConstructor> {
    CONSTRUCTORS.get(kind).copied()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions(HashMap<String, String>);

impl BackendOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> BlobResult<&str> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BlobError::config(format!("missing required option {key}")))
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("1") | Some("yes"))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for BackendOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub name: String,
    pub kind: String,
    pub options: BackendOptions,
}

/// Parses backend declarations out of environment variables.
///
/// `BACKEND_<NAME>=kind=<kind> k1=v1 ...` declares a backend (`backend=` is
/// accepted in place of `kind=`), and `BACKEND_<NAME>_<KEY>=value` adds one
/// option to it. Names and option keys are lower-cased.
pub fn parse_backend_env<I, K, V>(vars: I) -> BlobResult<Vec<BackendConfig>>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let vars: Vec<(String, String)> = vars
        .into_iter()
        .filter_map(|(k, v)| {
            let name = k.as_ref().strip_prefix(ENV_PREFIX)?;
            Some((name.to_string(), v.as_ref().to_string()))
        })
        .collect();

    let mut configs: HashMap<String, BackendConfig> = HashMap::new();
    for (name, value) in vars.iter().filter(|(name, _)| is_backend_name(name)) {
        let mut options = BackendOptions::default();
        let mut kind = None;
        for token in value.split_whitespace() {
            let (key, val) = token.split_once('=').ok_or_else(|| {
                BlobError::config(format!("invalid option {token:?} for backend {name}"))
            })?;
            match key {
                "kind" | "backend" => kind = Some(val.to_string()),
                _ => options.insert(key.to_lowercase(), val),
            }
        }
        let kind =
            kind.ok_or_else(|| BlobError::config(format!("backend {name} has no kind")))?;
        let name = name.to_lowercase();
        configs.insert(
            name.clone(),
            BackendConfig {
                name,
                kind,
                options,
            },
        );
    }

    for (key, value) in &vars {
        let Some((name, option)) = key.split_once('_') else {
            continue;
        };
        if !is_backend_name(name) || option.is_empty() {
            continue;
        }
        if let Some(config) = configs.get_mut(&name.to_lowercase()) {
            config.options.insert(option.to_lowercase(), value.as_str());
        }
    }

    let mut configs: Vec<BackendConfig> = configs.into_values().collect();
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(configs)
}

fn is_backend_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Configured backends by name, plus the default new uploads go to.
#[derive(Clone)]
pub struct Backends {
    backends: Arc<HashMap<String, Arc<dyn Backend>>>,
    default: Arc<dyn Backend>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("names", &self.names())
            .field("default", &self.default.name())
            .finish()
    }
}

impl Backends {
    /// Builds the configured backends next to the built-in `postgres` one.
    /// Any construction or validation failure aborts.
    pub async fn from_configs(configs: Vec<BackendConfig>, default: &str) -> BlobResult<Self> {
        let mut backends: Vec<Arc<dyn Backend>> = vec![Arc::new(PostgresBackend::new())];
        for config in configs {
            if config.name == POSTGRES_BACKEND {
                return Err(BlobError::config(format!(
                    "backend name {POSTGRES_BACKEND} is reserved"
                )));
            }
            let construct = constructor(&config.kind).ok_or_else(|| BlobError::UnknownBackend {
                name: config.kind.clone(),
            })?;
            info!(name = %config.name, kind = %config.kind, "initializing backend");
            backends.push(construct(config.name, config.options).await?);
        }
        Self::new(backends, default)
    }

    pub fn new(backends: Vec<Arc<dyn Backend>>, default: &str) -> BlobResult<Self> {
        let mut by_name = HashMap::new();
        for backend in backends {
            let name = backend.name().to_string();
            if by_name.insert(name.clone(), backend).is_some() {
                return Err(BlobError::config(format!("backend {name} declared twice")));
            }
        }
        let default = by_name
            .get(default)
            .cloned()
            .ok_or_else(|| BlobError::UnknownBackend {
                name: default.to_string(),
            })?;
        Ok(Self {
            backends: Arc::new(by_name),
            default,
        })
    }

    pub fn get(&self, name: &str) -> BlobResult<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BlobError::UnknownBackend {
                name: name.to_string(),
            })
    }

    pub fn default_backend(&self) -> Arc<dyn Backend> {
        self.default.clone()
    }

    pub fn default_name(&self) -> &str {
        self.default.name()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Vec<(String, String)> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_backend_env() -> BlobResult<()> {
        let configs = parse_backend_env(env(&[
            ("BACKEND_S3MAIN", "kind=s3 region=us-east-1 bucket=blobs"),
            ("BACKEND_S3MAIN_ACCESS_KEY_ID", "AKIA"),
            ("BACKEND_GCS", "backend=gcs bucket=other"),
            ("BACKEND_GCS_KEY", "{\"type\": \"service_account\"}"),
            ("BACKEND_UNKNOWN_BUCKET", "ignored"),
            ("DEFAULT_BACKEND", "s3main"),
        ]))?;

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "gcs");
        assert_eq!(configs[0].kind, "gcs");
        assert_eq!(
            configs[0].options.get("key"),
            Some("{\"type\": \"service_account\"}")
        );

        let s3 = &configs[1];
        assert_eq!(s3.name, "s3main");
        assert_eq!(s3.kind, "s3");
        assert_eq!(s3.options.get("bucket"), Some("blobs"));
        assert_eq!(s3.options.get("region"), Some("us-east-1"));
        assert_eq!(s3.options.get("access_key_id"), Some("AKIA"));
        assert_eq!(s3.options.get("kind"), None);
        Ok(())
    }

    #[test]
    fn test_parse_backend_env_errors() {
        assert!(parse_backend_env(env(&[("BACKEND_S3", "bucket=blobs")])).is_err());
        assert!(parse_backend_env(env(&[("BACKEND_S3", "kind=s3 bucket")])).is_err());
    }

    #[test]
    fn test_options() {
        let opts: BackendOptions = [("bucket", "b"), ("ec2_role", "true"), ("empty", "")]
            .into_iter()
            .collect();
        assert_eq!(opts.require("bucket").ok(), Some("b"));
        assert!(opts.require("empty").is_err());
        assert!(opts.require("missing").is_err());
        assert!(opts.flag("ec2_role"));
        assert!(!opts.flag("bucket"));
    }

    #[tokio::test]
    async fn test_backends_default_must_exist() -> BlobResult<()> {
        let backends = Backends::from_configs(vec![], POSTGRES_BACKEND).await?;
        assert_eq!(backends.default_name(), POSTGRES_BACKEND);
        assert_eq!(backends.names(), vec![POSTGRES_BACKEND]);
        assert!(backends.get("s3").is_err());

        let err = Backends::from_configs(vec![], "s3").await.unwrap_err();
        assert!(matches!(err, BlobError::UnknownBackend { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_kind_and_reserved_name() {
        let unknown = BackendConfig {
            name: "tape".to_string(),
            kind: "tape".to_string(),
            options: BackendOptions::default(),
        };
        let err = Backends::from_configs(vec![unknown], POSTGRES_BACKEND)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::UnknownBackend { .. }));

        let reserved = BackendConfig {
            name: POSTGRES_BACKEND.to_string(),
            kind: "file".to_string(),
            options: BackendOptions::default(),
        };
        assert!(Backends::from_configs(vec![reserved], POSTGRES_BACKEND)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_local_backend_from_config() -> BlobResult<()> {
        let dir = tempfile::tempdir()?;
        let config = BackendConfig {
            name: "local".to_string(),
            kind: "file".to_string(),
            options: [("path", dir.path().to_string_lossy().to_string())]
                .into_iter()
                .collect(),
        };
        let backends = Backends::from_configs(vec![config], "local").await?;
        assert_eq!(backends.default_name(), "local");
        assert_eq!(backends.names(), vec!["local", POSTGRES_BACKEND]);
        Ok(())
    }
}
