//! Deployment profiles and the frozen per-invocation environment.
//!
//! A profile names everything one deployment touches: the hosts, the accounts, the
//! filesystem layout, and the public domain. Profiles live in
//! `config_dir()/profiles.yaml` and resolve exactly once per invocation into a
//! [Context], which every other component receives by shared reference. No component
//! reads configuration any other way.

use crate::config;
use crate::core::ServiceDescriptor;
use anyhow::Context as _;
use indexmap::IndexMap;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};

/// A deployment profile failed to resolve.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigurationError {
    /// The named profile does not exist in the profiles file.
    UnknownProfile(String),

    /// A field the engine requires is absent or blank in the named profile.
    MissingField {
        profile: String,
        field: &'static str,
    },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::UnknownProfile(profile) => {
                write!(f, "unknown profile: {profile}")
            }
            ConfigurationError::MissingField { profile, field } => {
                write!(f, "profile \"{profile}\" is missing required field: {field}")
            }
        }
    }
}

impl Error for ConfigurationError {}

/// One entry in the profiles file, exactly as the operator wrote it.
///
/// Every field the engine requires is validated by [Profile::freeze]; fields that
/// aren't recognized at all are rejected when the file is parsed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// The hosts to deploy to. Values are passed verbatim to SSH, so anything the
    /// operator's SSH configuration understands is fair game.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// The login account on each host. Must be able to run commands as the host
    /// administrator. Source checkouts and builds run as this account.
    #[serde(default)]
    pub user: String,

    /// The account that owns and runs the deployed services.
    #[serde(default)]
    pub runner_user: String,

    /// The group of [Self::runner_user].
    #[serde(default)]
    pub runner_group: String,

    /// Short name of the project; no spaces or special characters. Service units and
    /// remote directories derive their names from it.
    #[serde(default)]
    pub project: String,

    /// The URL of the project's source repository.
    #[serde(default)]
    pub repository: String,

    /// The branch to deploy. Defaults to `master`.
    #[serde(default)]
    pub branch: String,

    /// The root under which everything on the host is deployed.
    #[serde(default)]
    pub deploy_root: String,

    /// The language-toolchain workspace root, holding source checkouts and the build
    /// output bin directory.
    #[serde(default)]
    pub workspace: String,

    /// The project's source checkout within [Self::workspace].
    #[serde(default)]
    pub source_dir: String,

    /// The public domain served by the web frontend and the reverse proxy.
    #[serde(default)]
    pub domain: String,

    /// The address the web frontend binds; the reverse proxy forwards to it.
    #[serde(default)]
    pub web_bind: String,

    /// Additional packages to install during bootstrap, beyond the base set.
    #[serde(default)]
    pub packages: Vec<String>,

    /// The reverse proxy's request body limit, in megabytes.
    #[serde(default = "default_client_max_body_size")]
    pub client_max_body_size: u32,

    /// Where configuration templates live on the control node. Defaults to the
    /// `templates` directory under the configuration directory.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    /// The control-node file holding the web frontend's session secret. Defaults to
    /// `session-secret` under the configuration directory.
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
}

fn default_client_max_body_size() -> u32 {
    200
}

// Keep the programmatic defaults identical to the serde defaults, so a Profile
// built in Rust and a profile parsed from an empty YAML mapping agree.
impl Default for Profile {
    fn default() -> Self {
        Profile {
            hosts: vec![],
            user: String::new(),
            runner_user: String::new(),
            runner_group: String::new(),
            project: String::new(),
            repository: String::new(),
            branch: String::new(),
            deploy_root: String::new(),
            workspace: String::new(),
            source_dir: String::new(),
            domain: String::new(),
            web_bind: String::new(),
            packages: vec![],
            client_max_body_size: default_client_max_body_size(),
            templates_dir: None,
            secret_file: None,
        }
    }
}

impl Profile {
    /// Validates this profile and derives the full [Context] from it.
    pub fn freeze(self, name: &str) -> Result<Context, ConfigurationError> {
        let missing = |field| ConfigurationError::MissingField {
            profile: name.to_owned(),
            field,
        };

        if self.hosts.iter().all(|host| host.trim().is_empty()) {
            return Err(missing("hosts"));
        }

        let required = [
            ("user", &self.user),
            ("runner_user", &self.runner_user),
            ("runner_group", &self.runner_group),
            ("project", &self.project),
            ("repository", &self.repository),
            ("deploy_root", &self.deploy_root),
            ("workspace", &self.workspace),
            ("source_dir", &self.source_dir),
            ("domain", &self.domain),
            ("web_bind", &self.web_bind),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(missing(field));
            }
        }

        let branch = match self.branch.trim().is_empty() {
            true => "master".to_owned(),
            false => self.branch.clone(),
        };

        let project_path = format!("{}/{}", self.deploy_root, self.project);
        let bin_dir = format!("{}/bin", self.workspace);
        let log_dir = format!("{}/logs", self.deploy_root);
        let web_path = format!("{project_path}/www");

        // The checkout's parent must exist before `git clone` runs; its basename is
        // what `go install` names the backend binary.
        let (source_parent, source_name) = match self.source_dir.rsplit_once('/') {
            Some((parent, name)) if !parent.is_empty() && !name.is_empty() => {
                (parent.to_owned(), name.to_owned())
            }
            _ => return Err(missing("source_dir")),
        };

        let service = |suffix: &str| ServiceDescriptor {
            name: format!("{}-{suffix}", self.project),
            log: format!("{log_dir}/{}-{suffix}.log", self.project),
        };
        let server = service("server");
        let client = service("client");
        let web = service("web");

        let server_binary = format!("{bin_dir}/{source_name}");
        let client_binary = format!("{bin_dir}/{}", client.name);
        let web_binary = format!("{web_path}/{}", web.name);
        let ssl_dir = format!("{}/ssl", self.deploy_root);

        Ok(Context {
            profile: name.to_owned(),
            hosts: self.hosts,
            user: self.user,
            runner_user: self.runner_user,
            runner_group: self.runner_group,
            project: self.project,
            repository: self.repository,
            branch,
            deploy_root: self.deploy_root,
            workspace: self.workspace,
            source_dir: self.source_dir,
            source_parent,
            domain: self.domain,
            web_bind: self.web_bind,
            packages: self.packages,
            client_max_body_size: self.client_max_body_size,
            templates_dir: self.templates_dir.unwrap_or_else(config::template_dir),
            secret_file: self.secret_file.unwrap_or_else(config::secret_path),
            data_dir: format!("{project_path}/db"),
            cache_dir: format!("{project_path}/httpcache"),
            ssl_dir,
            project_path,
            bin_dir,
            log_dir,
            web_path,
            server,
            client,
            web,
            server_binary,
            client_binary,
            web_binary,
        })
    }
}

/// The environment for one deployment run, resolved once and then read-only.
///
/// Every component receives the context as `&Context`; nothing mutates it after
/// [Context::resolve] returns, and nothing reads configuration through any other
/// channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    /// The name of the profile this context was resolved from.
    pub profile: String,

    /// The hosts to deploy to.
    pub hosts: Vec<String>,

    /// The login account on each host.
    pub user: String,

    /// The account that owns and runs the deployed services.
    pub runner_user: String,

    /// The group of [Self::runner_user].
    pub runner_group: String,

    /// Short name of the project.
    pub project: String,

    /// The URL of the project's source repository.
    pub repository: String,

    /// The branch to deploy.
    pub branch: String,

    /// The root under which everything on the host is deployed.
    pub deploy_root: String,

    /// The language-toolchain workspace root.
    pub workspace: String,

    /// The project's source checkout within the workspace.
    pub source_dir: String,

    /// The parent directory of [Self::source_dir].
    pub source_parent: String,

    /// The public domain served by the web frontend and the reverse proxy.
    pub domain: String,

    /// The address the web frontend binds.
    pub web_bind: String,

    /// Additional packages to install during bootstrap.
    pub packages: Vec<String>,

    /// The reverse proxy's request body limit, in megabytes.
    pub client_max_body_size: u32,

    /// Where configuration templates live on the control node.
    pub templates_dir: PathBuf,

    /// The control-node file holding the web frontend's session secret.
    pub secret_file: PathBuf,

    /// `<deploy_root>/<project>`: the project's own directory on the host.
    pub project_path: String,

    /// `<workspace>/bin`: build output directory.
    pub bin_dir: String,

    /// `<deploy_root>/logs`: the group-writable log directory.
    pub log_dir: String,

    /// `<project_path>/db`: the backend's data store, owned by the runner account.
    pub data_dir: String,

    /// `<project_path>/httpcache`: the client daemon's cache, owned by the runner
    /// account.
    pub cache_dir: String,

    /// `<project_path>/www`: the web frontend's asset tree.
    pub web_path: String,

    /// `<deploy_root>/ssl`: where TLS material lives.
    pub ssl_dir: String,

    /// The backend daemon.
    pub server: ServiceDescriptor,

    /// The client daemon.
    pub client: ServiceDescriptor,

    /// The web frontend.
    pub web: ServiceDescriptor,

    /// Where `go install` leaves the backend binary.
    pub server_binary: String,

    /// Where the client build publishes its binary.
    pub client_binary: String,

    /// Where the web build publishes its binary.
    pub web_binary: String,
}

impl Context {
    /// Resolves the named profile from the profiles file in the configuration
    /// directory.
    pub fn resolve(profile: &str) -> anyhow::Result<Self> {
        Self::resolve_from(config::profiles_path(), profile)
    }

    /// Resolves the named profile from an explicit profiles file.
    pub fn resolve_from(path: impl AsRef<Path>, profile: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read profiles file: {}", path.display()))?;

        let mut profiles: IndexMap<String, Profile> = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse profiles file: {}", path.display()))?;

        let raw = profiles
            .swap_remove(profile)
            .ok_or_else(|| ConfigurationError::UnknownProfile(profile.to_owned()))?;

        Ok(raw.freeze(profile)?)
    }

    /// Exports the context as ordered template bindings.
    ///
    /// Tasks extend the returned map with their own overrides before rendering; the
    /// base bindings are identical for every task in a run.
    pub fn vars(&self) -> IndexMap<String, String> {
        IndexMap::from_iter([
            ("project".to_owned(), self.project.clone()),
            ("repository".to_owned(), self.repository.clone()),
            ("branch".to_owned(), self.branch.clone()),
            ("domain".to_owned(), self.domain.clone()),
            ("user".to_owned(), self.user.clone()),
            ("runner_user".to_owned(), self.runner_user.clone()),
            ("runner_group".to_owned(), self.runner_group.clone()),
            ("deploy_root".to_owned(), self.deploy_root.clone()),
            ("workspace".to_owned(), self.workspace.clone()),
            ("project_path".to_owned(), self.project_path.clone()),
            ("source_dir".to_owned(), self.source_dir.clone()),
            ("bin_dir".to_owned(), self.bin_dir.clone()),
            ("log_dir".to_owned(), self.log_dir.clone()),
            ("data_dir".to_owned(), self.data_dir.clone()),
            ("cache_dir".to_owned(), self.cache_dir.clone()),
            ("web_path".to_owned(), self.web_path.clone()),
            ("ssl_dir".to_owned(), self.ssl_dir.clone()),
            ("web_bind".to_owned(), self.web_bind.clone()),
            (
                "client_max_body_size".to_owned(),
                self.client_max_body_size.to_string(),
            ),
            ("server_unit".to_owned(), self.server.name.clone()),
            ("client_unit".to_owned(), self.client.name.clone()),
            ("web_unit".to_owned(), self.web.name.clone()),
            ("server_log".to_owned(), self.server.log.clone()),
            ("client_log".to_owned(), self.client.log.clone()),
            ("web_log".to_owned(), self.web.log.clone()),
            ("server_binary".to_owned(), self.server_binary.clone()),
            ("client_binary".to_owned(), self.client_binary.clone()),
            ("web_binary".to_owned(), self.web_binary.clone()),
        ])
    }
}
