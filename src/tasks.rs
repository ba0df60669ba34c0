//! The deployment task catalog.
//!
//! Each function here restates one deployable outcome as a [DeploymentTask]: which
//! directories must exist, which artifacts to render and install, what to fetch,
//! build, and publish, and which service to cycle. Builders are pure except for
//! reading template sources (and, for the web frontend, the session secret) from the
//! control node; all remote work happens later, in [mod@crate::run_task].
//!
//! Templates render at construction time, so a missing binding aborts a task before
//! it has touched any host.

use crate::core::step::{Precondition, RemoteCommand, Step};
use crate::core::{Artifact, CertificateBundle, DeploymentTask};
use crate::profile::Context;
use crate::template;
use anyhow::{bail, Context as _};
use indexmap::IndexMap;
use std::fs;

/// Packages every host needs before any service can be built or run.
const BASE_PACKAGES: &str = "git-core golang imagemagick unzip tmux nodejs npm";

/// Build dependencies for packaging the storage engine.
const STORAGE_BUILD_PACKAGES: &str =
    "debhelper libsnappy-dev libgflags-dev libjemalloc-dev libbz2-dev zlib1g-dev devscripts";

/// The marker nginx prints when a configuration test fails. The validator's exit
/// code is checked first; this is the documented fallback.
const PROXY_FAILURE_MARKER: &str = "test failed";

/// The task names [task] recognizes, in the order an operator would typically run
/// them against a fresh host.
pub const TASK_NAMES: &[&str] = &[
    "bootstrap",
    "config",
    "server",
    "client",
    "web",
    "tls",
    "proxy",
];

/// Builds the task registered under `name`.
pub fn task(name: &str, context: &Context) -> anyhow::Result<DeploymentTask> {
    match name {
        "bootstrap" => bootstrap(context),
        "config" => config(context),
        "server" => server(context),
        "client" => client(context),
        "web" => web(context),
        "tls" => tls(context),
        "proxy" => proxy(context),
        _ => bail!(
            "unknown task \"{name}\"; expected one of: {}",
            TASK_NAMES.join(", "),
        ),
    }
}

/// Installs system packages and host-level prerequisites.
pub fn bootstrap(context: &Context) -> anyhow::Result<DeploymentTask> {
    let mut steps = vec![
        Step::sudo("apt-get update"),
        Step::sudo(format!("apt-get -y install {BASE_PACKAGES}")),
        Step::sudo(format!("apt-get -y install {STORAGE_BUILD_PACKAGES}")),
    ];

    if !context.packages.is_empty() {
        steps.push(Step::sudo(format!(
            "apt-get -y install {}",
            context.packages.join(" "),
        )));
    }

    for line in ["LANG=\"en_US.UTF-8\"", "LANGUAGE=\"en_US:en\""] {
        steps.push(Step::sudo_unless(
            format!("echo '{line}' >> /etc/default/locale"),
            Precondition::LinePresent {
                pattern: line.to_owned(),
                path: "/etc/default/locale".to_owned(),
            },
        ));
    }
    steps.push(Step::sudo("locale-gen en_US.UTF-8"));
    steps.push(Step::sudo("update-locale en_US.UTF-8"));

    // The asset bundler is invoked by name during web deploys.
    steps.push(Step::sudo_unless(
        "npm install -g gulp",
        Precondition::PathPresent("/usr/local/bin/gulp".to_owned()),
    ));
    steps.push(Step::sudo_unless(
        "ln -s /usr/bin/nodejs /usr/bin/node",
        Precondition::PathPresent("/usr/bin/node".to_owned()),
    ));

    Ok(DeploymentTask {
        name: "bootstrap".to_owned(),
        steps,
    })
}

/// Distributes the shared configuration and storage credentials.
pub fn config(context: &Context) -> anyhow::Result<DeploymentTask> {
    let vars = context.vars();
    let steps = vec![
        ensure_dir(&context.project_path),
        secret_artifact(context, &vars, "config.json")?,
        secret_artifact(context, &vars, "storage-credentials.json")?,
    ];

    Ok(DeploymentTask {
        name: "config".to_owned(),
        steps,
    })
}

/// Deploys the backend daemon: layout, unit, source, build, lifecycle.
pub fn server(context: &Context) -> anyhow::Result<DeploymentTask> {
    let mut steps = layout(context);
    steps.push(Step::sudo_unless(
        format!(
            "mkdir -p {} && chown {}:{} {}",
            context.data_dir, context.runner_user, context.runner_group, context.data_dir,
        ),
        Precondition::PathPresent(context.data_dir.clone()),
    ));
    steps.extend(log_permissions(context));

    steps.push(unit_artifact(context, &context.vars(), "server.service", &context.server.name)?);
    steps.push(Step::sudo("systemctl daemon-reload"));

    steps.push(checkout(context));
    steps.push(build(context, &context.source_dir, "go get ."));
    steps.push(build(context, &context.source_dir, "go install"));

    steps.push(Step::Stop(context.server.clone()));
    steps.push(Step::Start(context.server.clone()));

    Ok(DeploymentTask {
        name: "server".to_owned(),
        steps,
    })
}

/// Deploys the client daemon.
pub fn client(context: &Context) -> anyhow::Result<DeploymentTask> {
    let mut steps = layout(context);
    steps.push(Step::sudo_unless(
        format!(
            "mkdir -p {} && chown {}:{} {}",
            context.cache_dir, context.runner_user, context.runner_group, context.cache_dir,
        ),
        Precondition::PathPresent(context.cache_dir.clone()),
    ));
    steps.extend(log_permissions(context));

    steps.push(unit_artifact(context, &context.vars(), "client.service", &context.client.name)?);
    steps.push(Step::sudo("systemctl daemon-reload"));

    let client_dir = format!("{}/client", context.source_dir);
    steps.push(checkout(context));
    steps.push(build(context, &client_dir, "go get ."));
    steps.push(build(
        context,
        &client_dir,
        &format!("go build && mv client {}", context.client_binary),
    ));

    steps.push(Step::Stop(context.client.clone()));
    steps.push(Step::Start(context.client.clone()));

    Ok(DeploymentTask {
        name: "client".to_owned(),
        steps,
    })
}

/// Deploys the web frontend: assets, embedded data, binary, and its unit.
pub fn web(context: &Context) -> anyhow::Result<DeploymentTask> {
    let secret = fs::read_to_string(&context.secret_file)
        .with_context(|| {
            format!(
                "failed to read session secret: {}",
                context.secret_file.display(),
            )
        })?
        .trim()
        .to_owned();

    // Task-local overrides: values only the web unit needs, passed explicitly
    // rather than ambiently.
    let mut unit_vars = context.vars();
    unit_vars.insert("session_secret".to_owned(), secret);
    unit_vars.insert(
        "config_file".to_owned(),
        format!("{}/config.json", context.project_path),
    );
    unit_vars.insert("public_path".to_owned(), context.web_path.clone());

    let mut steps = vec![Step::sudo_unless(
        format!(
            "mkdir -p {} && chown {}:{} {} && chown {} {}",
            context.web_path,
            context.runner_user,
            context.runner_group,
            context.web_path,
            context.runner_user,
            context.log_dir,
        ),
        Precondition::PathPresent(context.web_path.clone()),
    )];

    steps.push(secret_artifact(context, &context.vars(), "auth-credentials.json")?);
    steps.push(unit_artifact(context, &unit_vars, "web.service", &context.web.name)?);
    steps.push(Step::sudo("systemctl daemon-reload"));

    steps.push(checkout(context));

    // The embedding tool compiles static assets and templates into the binary; it
    // only needs installing once per workspace.
    steps.push(Step::run_unless(
        format!(
            "export GOPATH={} && go get -u github.com/jteeuwen/go-bindata/...",
            context.workspace,
        ),
        Precondition::PathPresent(format!("{}/go-bindata", context.bin_dir)),
    ));

    let httpd_dir = format!("{}/httpd", context.source_dir);
    steps.push(build(context, &httpd_dir, "npm install && gulp release"));
    steps.push(build(
        context,
        &httpd_dir,
        &format!(
            "{}/go-bindata -pkg=server -o=./src/bindata.go static/... templates/",
            context.bin_dir,
        ),
    ));
    steps.push(build(context, &httpd_dir, "go get ."));
    steps.push(build(context, &httpd_dir, "go build"));

    steps.push(Step::sudo(format!(
        "mv {}/httpd {} && cp -a {}/templates {}/ && chown -R {}:{} {}",
        httpd_dir,
        context.web_binary,
        httpd_dir,
        context.web_path,
        context.runner_user,
        context.runner_group,
        context.web_path,
    )));

    steps.push(Step::Stop(context.web.clone()));
    steps.push(Step::Start(context.web.clone()));

    Ok(DeploymentTask {
        name: "web".to_owned(),
        steps,
    })
}

/// Bootstraps TLS material for the profile's domain.
///
/// Two-phase: the first run creates a key and signing request, then halts for the
/// certificate authority; a re-run with the signed certificate in place tightens
/// permissions.
pub fn tls(context: &Context) -> anyhow::Result<DeploymentTask> {
    let steps = vec![
        ensure_dir(&context.ssl_dir),
        Step::Certificate(CertificateBundle::for_domain(
            &context.ssl_dir,
            &context.domain,
        )),
    ];

    Ok(DeploymentTask {
        name: "tls".to_owned(),
        steps,
    })
}

/// Deploys the reverse proxy's virtual host: render, install, test, reload.
pub fn proxy(context: &Context) -> anyhow::Result<DeploymentTask> {
    let mut vars = context.vars();
    vars.insert("public_path".to_owned(), context.web_path.clone());

    let source = template::load(&context.templates_dir, "proxy.conf")?;
    let content = template::render("proxy.conf", &source, &vars)?;

    let steps = vec![
        Step::Install {
            artifact: Artifact {
                content,
                dest: format!("/etc/nginx/sites-enabled/{}.conf", context.project),
                owner: "root".to_owned(),
                group: "root".to_owned(),
                mode: "644".to_owned(),
                elevated: true,
            },
            unless: None,
        },
        Step::CheckProxy {
            command: RemoteCommand::elevated("nginx -t -c /etc/nginx/nginx.conf"),
            failure_marker: PROXY_FAILURE_MARKER.to_owned(),
        },
        Step::sudo("nginx -s reload"),
    ];

    Ok(DeploymentTask {
        name: "proxy".to_owned(),
        steps,
    })
}

// An elevated `mkdir -p`, guarded so a provisioned host sees no mutation.
fn ensure_dir(path: &str) -> Step {
    Step::sudo_unless(
        format!("mkdir -p {path}"),
        Precondition::PathPresent(path.to_owned()),
    )
}

// The directory layout shared by every service deploy: the project directory, the
// toolchain workspace (owned by the login user so checkouts and builds can write),
// and the log directory.
fn layout(context: &Context) -> Vec<Step> {
    vec![
        ensure_dir(&context.project_path),
        Step::sudo_unless(
            format!(
                "mkdir -p {} && mkdir -p {} && chown -R {}:{} {}",
                context.bin_dir,
                context.source_parent,
                context.user,
                context.user,
                context.workspace,
            ),
            Precondition::PathPresent(context.bin_dir.clone()),
        ),
        ensure_dir(&context.log_dir),
    ]
}

// Log directory ownership and group-writable permissions; re-applied on every run.
fn log_permissions(context: &Context) -> Vec<Step> {
    vec![
        Step::sudo(format!(
            "chown {} {}",
            context.runner_user, context.log_dir,
        )),
        Step::sudo(format!("chmod -R 775 {}", context.log_dir)),
    ]
}

// Clone-or-update of the project checkout.
fn checkout(context: &Context) -> Step {
    Step::Checkout {
        repository: context.repository.clone(),
        dest: context.source_dir.clone(),
        branch: context.branch.clone(),
    }
}

// A build stage with the workspace exported for the language toolchain.
fn build(context: &Context, dir: &str, command: &str) -> Step {
    Step::Build {
        dir: dir.to_owned(),
        command: command.to_owned(),
        env: vec![("GOPATH".to_owned(), context.workspace.clone())],
    }
}

// Renders a restricted configuration artifact owned by the runner account.
fn secret_artifact(
    context: &Context,
    vars: &IndexMap<String, String>,
    name: &str,
) -> anyhow::Result<Step> {
    let source = template::load(&context.templates_dir, name)?;
    let content = template::render(name, &source, vars)?;

    Ok(Step::Install {
        artifact: Artifact {
            content,
            dest: format!("{}/{name}", context.project_path),
            owner: context.runner_user.clone(),
            group: context.runner_group.clone(),
            mode: "600".to_owned(),
            elevated: true,
        },
        unless: None,
    })
}

// Renders an init unit definition for the named service.
fn unit_artifact(
    context: &Context,
    vars: &IndexMap<String, String>,
    template_name: &str,
    unit: &str,
) -> anyhow::Result<Step> {
    let source = template::load(&context.templates_dir, template_name)?;
    let content = template::render(template_name, &source, vars)?;

    Ok(Step::Install {
        artifact: Artifact {
            content,
            dest: format!("/etc/systemd/system/{unit}.service"),
            owner: "root".to_owned(),
            group: "root".to_owned(),
            mode: "644".to_owned(),
            elevated: true,
        },
        unless: None,
    })
}
