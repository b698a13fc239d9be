pub const DEFAULT_ROOT_KEY: &str = "movie";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_PATH: &str = "movieserver.db";
const DEFAULT_REINDEX_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no movie roots given")]
    NoRoots,
    #[error("root argument '{0}' has an empty key or path")]
    EmptyRoot(String),
    #[error("root key '{0}' is given more than once")]
    DuplicateKey(String),
    #[error("{name} must be {expected}, got '{value}'")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("credential '{0}' must look like user:password")]
    InvalidCredential(String),
    #[error("invalid root '{key}': {source}")]
    Root {
        key: String,
        #[source]
        source: crate::walker::WalkError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootArg {
    pub key: String,
    pub path: std::path::PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub roots: Vec<RootArg>,
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub refresh_schema: bool,
    pub reindex_interval: Option<std::time::Duration>,
    pub watch: bool,
    pub template_dir: Option<std::path::PathBuf>,
    pub static_dir: Option<std::path::PathBuf>,
    pub credentials: Vec<(String, String)>,
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            expected: "a boolean",
            value: value.to_owned(),
        }),
    }
}

fn parse_root(arg: &str) -> Result<RootArg, ConfigError> {
    let (key, path) = match arg.split_once('=') {
        Some((key, path)) if !key.contains('/') => (key, path),
        _ => (DEFAULT_ROOT_KEY, arg),
    };
    if key.is_empty() || path.is_empty() {
        return Err(ConfigError::EmptyRoot(arg.to_owned()));
    }
    Ok(RootArg {
        key: key.to_owned(),
        path: std::path::PathBuf::from(path),
    })
}

fn parse_credentials(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((user, password)) if !user.is_empty() => {
                Ok((user.to_owned(), password.to_owned()))
            }
            _ => Err(ConfigError::InvalidCredential(pair.to_owned())),
        })
        .collect()
}

impl Config {
    /// Reads roots from the command line and everything else from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_sources(std::env::args().skip(1), |name| std::env::var(name).ok())
    }

    pub fn from_sources<I, E>(args: I, env: E) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
        E: Fn(&str) -> Option<String>,
    {
        let mut roots: Vec<RootArg> = Vec::new();
        for arg in args {
            let root = parse_root(&arg)?;
            if roots.iter().any(|r| r.key == root.key) {
                return Err(ConfigError::DuplicateKey(root.key));
            }
            roots.push(root);
        }
        if roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }

        let port = match env("PORT") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                expected: "a port number",
                value,
            })?,
            None => DEFAULT_PORT,
        };

        let reindex_secs = match env("MOVIESERVER_REINDEX_SECS") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "MOVIESERVER_REINDEX_SECS",
                expected: "a number of seconds",
                value,
            })?,
            None => DEFAULT_REINDEX_SECS,
        };

        let flag = |name: &'static str, default: bool| match env(name) {
            Some(value) => parse_bool(name, &value),
            None => Ok(default),
        };

        Ok(Self {
            roots,
            port,
            db_path: env("MOVIESERVER_DB")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_DB_PATH)),
            refresh_schema: flag("MOVIESERVER_REFRESH_SCHEMA", false)?,
            reindex_interval: (reindex_secs > 0)
                .then(|| std::time::Duration::from_secs(reindex_secs)),
            watch: flag("MOVIESERVER_WATCH", true)?,
            template_dir: env("MOVIESERVER_TEMPLATE_DIR").map(std::path::PathBuf::from),
            static_dir: env("MOVIESERVER_STATIC_DIR").map(std::path::PathBuf::from),
            credentials: match env("MOVIESERVER_CREDENTIALS") {
                Some(value) => parse_credentials(&value)?,
                None => Vec::new(),
            },
        })
    }

    /// Validates every configured root. The first bad one aborts startup.
    pub fn open_roots(&self) -> Result<Vec<crate::walker::MovieRoot>, ConfigError> {
        self.roots
            .iter()
            .map(|arg| {
                crate::walker::MovieRoot::open(&arg.key, &arg.path).map_err(|source| {
                    ConfigError::Root {
                        key: arg.key.clone(),
                        source,
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn defaults() {
        let config = Config::from_sources(args(&["/srv/movies"]), env_from(&[])).expect("config");
        assert_eq!(
            config.roots,
            vec![RootArg {
                key: "movie".to_owned(),
                path: "/srv/movies".into(),
            }]
        );
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, std::path::PathBuf::from("movieserver.db"));
        assert!(!config.refresh_schema);
        assert_eq!(config.reindex_interval, Some(std::time::Duration::from_secs(5)));
        assert!(config.watch);
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn keyed_roots_and_environment() {
        let config = Config::from_sources(
            args(&["movie=/srv/movies", "tv=/srv/tv", "/srv/a=b"]),
            env_from(&[
                ("PORT", "10000"),
                ("MOVIESERVER_REINDEX_SECS", "0"),
                ("MOVIESERVER_WATCH", "off"),
                ("MOVIESERVER_REFRESH_SCHEMA", "true"),
                ("MOVIESERVER_CREDENTIALS", "alice:secret, bob:pa:ss"),
            ]),
        );
        assert!(matches!(config, Err(ConfigError::DuplicateKey(ref key)) if key == "movie"));

        let config = Config::from_sources(
            args(&["movie=/srv/movies", "tv=/srv/tv"]),
            env_from(&[
                ("PORT", "10000"),
                ("MOVIESERVER_REINDEX_SECS", "0"),
                ("MOVIESERVER_WATCH", "off"),
                ("MOVIESERVER_REFRESH_SCHEMA", "true"),
                ("MOVIESERVER_CREDENTIALS", "alice:secret, bob:pa:ss"),
            ]),
        )
        .expect("config");
        assert_eq!(config.roots.len(), 2);
        assert_eq!(config.roots[1].key, "tv");
        assert_eq!(config.port, 10000);
        assert_eq!(config.reindex_interval, None);
        assert!(!config.watch);
        assert!(config.refresh_schema);
        assert_eq!(
            config.credentials,
            vec![
                ("alice".to_owned(), "secret".to_owned()),
                ("bob".to_owned(), "pa:ss".to_owned()),
            ]
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            Config::from_sources(Vec::new(), env_from(&[])),
            Err(ConfigError::NoRoots)
        ));
        assert!(matches!(
            Config::from_sources(args(&["=/srv"]), env_from(&[])),
            Err(ConfigError::EmptyRoot(_))
        ));
        assert!(matches!(
            Config::from_sources(args(&["/srv"]), env_from(&[("PORT", "http")])),
            Err(ConfigError::InvalidValue { name: "PORT", .. })
        ));
        assert!(matches!(
            Config::from_sources(args(&["/srv"]), env_from(&[("MOVIESERVER_WATCH", "maybe")])),
            Err(ConfigError::InvalidValue {
                name: "MOVIESERVER_WATCH",
                ..
            })
        ));
        assert!(matches!(
            Config::from_sources(args(&["/srv"]), env_from(&[("MOVIESERVER_CREDENTIALS", "nopass")])),
            Err(ConfigError::InvalidCredential(_))
        ));
    }

    #[test]
    fn open_roots_reports_the_bad_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = format!("good={}", dir.path().display());
        let bad = format!("bad={}", dir.path().join("missing").display());

        let config = Config::from_sources(vec![good.clone()], env_from(&[])).expect("config");
        assert_eq!(config.open_roots().expect("roots")[0].key, "good");

        let config = Config::from_sources(vec![good, bad], env_from(&[])).expect("config");
        assert!(matches!(
            config.open_roots(),
            Err(ConfigError::Root { ref key, .. }) if key == "bad"
        ));
    }
}
