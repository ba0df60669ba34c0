use super::*;
use crate::core::fixtures::{context, task};
use crate::core::ServiceDescriptor;
use crate::tasks;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod fixtures {
    use super::*;

    // Builds an Output value the way a unix wait status would: the exit code lives in
    // the high byte.
    pub fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    pub mod session {
        use super::*;

        // A factory that tests can pass into _run_task. Spawns TestSession values
        // when asked to connect to hosts, but holds onto references to each session's
        // command records so that tests can examine them later.
        //
        // The factory also plays the part of the remote hosts themselves: probe
        // commands answer from `present_paths` and `present_lines`, and a handful of
        // mutating commands (mkdir -p, git clone, echo >>) update that state, which
        // is just enough simulation to run a task twice and watch guarded steps skip.
        #[derive(Debug, Default)]
        pub struct TestSessionFactory {
            // A record of all commands run on all hosts.
            commands: SessionCommands,

            // Hosts that the connect method should not be able to reach.
            unreachable: HashSet<String>,

            // Paths that `test -e` probes report as present.
            present_paths: HashSet<String>,

            // (pattern, path) pairs that `grep -q` probes report as present.
            present_lines: HashSet<(String, String)>,

            // Canned responses, matched against the shell line by substring, first
            // match wins. Checked before the simulated host state.
            scripted: Vec<ScriptedResponse>,
        }

        #[derive(Clone, Debug)]
        pub struct ScriptedResponse {
            pub pattern: String,
            pub exit_code: i32,
            pub stdout: String,
            pub stderr: String,
        }

        // Maps host name -> SharedRecords.
        type SessionCommands = HashMap<String, SharedRecords>;

        // The record of commands run on a single host.
        type SharedRecords = Arc<Mutex<Vec<CommandRecord>>>;

        #[derive(Clone, Debug, Eq, PartialEq)]
        pub struct CommandRecord {
            pub method_name: &'static str,
            pub line: String,
            pub elevated: bool,
        }

        impl TestSessionFactory {
            pub fn new() -> Arc<Mutex<Self>> {
                Arc::new(Mutex::new(Self::default()))
            }

            pub fn set_unreachable(&mut self, host: impl Into<String>) {
                self.unreachable.insert(host.into());
            }

            pub fn mark_path_present(&mut self, path: impl Into<String>) {
                self.present_paths.insert(path.into());
            }

            pub fn mark_line_present(&mut self, pattern: impl Into<String>, path: impl Into<String>) {
                self.present_lines.insert((pattern.into(), path.into()));
            }

            // Commands whose line contains `pattern` exit non-zero.
            pub fn fail_matching(&mut self, pattern: impl Into<String>) {
                self.scripted.push(ScriptedResponse {
                    pattern: pattern.into(),
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "failing as expected".to_owned(),
                });
            }

            pub fn respond(&mut self, response: ScriptedResponse) {
                self.scripted.push(response);
            }

            pub fn hosts_seen(&self) -> Vec<String> {
                self.commands.keys().cloned().collect()
            }

            pub fn commands_for(&self, host: &str) -> Vec<CommandRecord> {
                match self.commands.get(host) {
                    Some(records) => records.lock().unwrap().clone(),
                    None => vec![],
                }
            }

            fn answer(&mut self, line: &str) -> Output {
                for scripted in &self.scripted {
                    if line.contains(&scripted.pattern) {
                        return output(
                            scripted.exit_code,
                            &scripted.stdout,
                            &scripted.stderr,
                        );
                    }
                }

                let words = shlex::split(line).unwrap_or_default();

                // Probes answer from the simulated host state.
                match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    ["test", "-e", path] => {
                        let code = match self.present_paths.contains(*path) {
                            true => 0,
                            false => 1,
                        };
                        return output(code, "", "");
                    }
                    ["grep", "-q", pattern, path] => {
                        let hit = self
                            .present_lines
                            .contains(&((*pattern).to_owned(), (*path).to_owned()));
                        return output(if hit { 0 } else { 1 }, "", "");
                    }
                    ["mktemp"] => return output(0, "/tmp/stevedore-stage\n", ""),
                    _ => {}
                }

                // Mutating commands leave just enough state behind that a second run
                // of the same task sees a provisioned host.
                for segment in words.split(|word| word.as_str() == "&&") {
                    match segment.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                        ["mkdir", "-p", path] => {
                            self.present_paths.insert((*path).to_owned());
                        }
                        ["git", "clone", _repository, dest] => {
                            self.present_paths.insert((*dest).to_owned());
                            self.present_paths.insert(format!("{dest}/.git"));
                        }
                        ["echo", text, ">>", path] => {
                            self.present_lines
                                .insert(((*text).to_owned(), (*path).to_owned()));
                        }
                        _ => {}
                    }
                }

                output(0, "", "")
            }
        }

        #[async_trait]
        impl Connect<TestSession> for Arc<Mutex<TestSessionFactory>> {
            async fn connect(&mut self, host: &str) -> anyhow::Result<TestSession> {
                let mut factory = self.lock().unwrap();
                if factory.unreachable.contains(host) {
                    anyhow::bail!("unreachable");
                }

                let records = factory
                    .commands
                    .entry(host.to_owned())
                    .or_default()
                    .clone();

                Ok(TestSession {
                    factory: self.clone(),
                    records,
                })
            }
        }

        #[derive(Clone, Debug)]
        pub struct TestSession {
            factory: Arc<Mutex<TestSessionFactory>>,
            records: SharedRecords,
        }

        #[async_trait]
        impl HostSession for TestSession {
            async fn run(&mut self, command: &RemoteCommand) -> anyhow::Result<Output> {
                self.records.lock().unwrap().push(CommandRecord {
                    method_name: "run",
                    line: command.line.clone(),
                    elevated: command.elevated,
                });
                Ok(self.factory.lock().unwrap().answer(&command.line))
            }

            async fn upload(&mut self, _from: &Path, to: &str) -> anyhow::Result<Output> {
                // The local path is a freshly created temp file, so recording it
                // would make assertions non-deterministic; the destination is what
                // tests care about.
                self.records.lock().unwrap().push(CommandRecord {
                    method_name: "upload",
                    line: to.to_owned(),
                    elevated: false,
                });
                self.factory
                    .lock()
                    .unwrap()
                    .present_paths
                    .insert(to.to_owned());
                Ok(output(0, "", ""))
            }
        }
    }
    pub use session::*;

    pub mod report {
        use super::*;
        use crate::run_task::report::{_completed, _halted, _skipped, _starting, _warning, Report};

        // A Report implementation that uses Vecs as fake stdout/stderr writers.
        // run_host_task needs an owned reporter per host, so TestReporter hands out
        // shared references to the same writers, and tests can hold onto a clone and
        // examine it after the code under test runs.
        #[derive(Debug, Default)]
        pub struct TestReporter {
            // The shared stdout writer.
            stdout: Mutex<Vec<u8>>,

            // The shared stderr writer.
            stderr: Mutex<Vec<u8>>,

            // Whether the completed method should return an error.
            should_fail: Mutex<bool>,
        }

        impl TestReporter {
            pub fn new() -> Arc<Self> {
                Arc::new(Self::default())
            }

            pub fn stdout(&self) -> String {
                String::from_utf8(self.stdout.lock().unwrap().clone()).unwrap()
            }

            pub fn stderr(&self) -> String {
                String::from_utf8(self.stderr.lock().unwrap().clone()).unwrap()
            }

            // Instructs this TestReporter to always fail, i.e. return an error from
            // the completed method.
            pub fn fail(&self) {
                *self.should_fail.lock().unwrap() = true;
            }
        }

        #[async_trait]
        impl Report for Arc<TestReporter> {
            async fn starting(&mut self, host: &str, step: &Step) -> io::Result<()> {
                _starting(self.stdout.lock().unwrap(), host, step)
            }

            async fn skipped(&mut self, host: &str, step: &Step) -> io::Result<()> {
                _skipped(self.stdout.lock().unwrap(), host, step)
            }

            async fn completed(
                &mut self,
                host: &str,
                step: &Step,
                output: &Output,
            ) -> io::Result<()> {
                let result = _completed(
                    self.stdout.lock().unwrap(),
                    self.stderr.lock().unwrap(),
                    host,
                    step,
                    output,
                );

                if *self.should_fail.lock().unwrap() {
                    Err(io::Error::other("expected"))
                } else {
                    result
                }
            }

            async fn warning(
                &mut self,
                host: &str,
                step: &Step,
                output: &Output,
            ) -> io::Result<()> {
                _warning(
                    self.stdout.lock().unwrap(),
                    self.stderr.lock().unwrap(),
                    host,
                    step,
                    output,
                )
            }

            async fn halted(&mut self, host: &str, reason: &str) -> io::Result<()> {
                _halted(self.stdout.lock().unwrap(), host, reason)
            }
        }
    }
    pub use report::*;

    pub mod fixture {
        use super::*;

        pub struct Fixture {
            pub host: String,
            pub task: DeploymentTask,
            pub factory: Arc<Mutex<TestSessionFactory>>,
            pub reporter: Arc<TestReporter>,
        }

        impl Fixture {
            pub fn new() -> Self {
                Fixture {
                    host: "app1".to_owned(),
                    task: task(),
                    factory: TestSessionFactory::new(),
                    reporter: TestReporter::new(),
                }
            }

            // Replaces the fixture task's steps.
            pub fn with_steps(steps: Vec<Step>) -> Self {
                let mut fixture = Self::new();
                fixture.task.steps = steps;
                fixture
            }

            // Returns a locked and modifiable TestSessionFactory.
            pub fn factory(&self) -> MutexGuard<'_, TestSessionFactory> {
                self.factory.lock().unwrap()
            }

            // Calls run_host_task, passing in Fixture's fields.
            pub async fn run_host_task(&self) -> anyhow::Result<()> {
                run_host_task(
                    self.host.clone(),
                    self.task.clone(),
                    self.factory.clone(),
                    self.reporter.clone(),
                )
                .await
            }

            // The commands recorded against the fixture host so far.
            pub fn recorded_commands(&self) -> Vec<CommandRecord> {
                self.factory().commands_for(&self.host)
            }

            // Just the shell lines, for tests that don't care about elevation.
            pub fn recorded_lines(&self) -> Vec<String> {
                self.recorded_commands()
                    .into_iter()
                    .map(|record| record.line)
                    .collect()
            }
        }
    }
    pub use fixture::*;
}
use fixtures::*;

mod _run_task {
    use super::*;

    #[tokio::test]
    async fn runs_task_for_all_hosts() {
        let fixture = Fixture::new();
        let hosts = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        _run_task(
            &fixture.task,
            &hosts,
            fixture.factory.clone(),
            fixture.reporter.clone(),
        )
        .await
        .unwrap();

        let mut seen = fixture.factory().hosts_seen();
        seen.sort();
        assert_eq!(hosts, seen);
    }

    #[tokio::test]
    async fn returns_all_errors() {
        let fixture = Fixture::new();
        let hosts = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        {
            let mut factory = fixture.factory();
            factory.set_unreachable("b");
            factory.set_unreachable("c");
        }

        let errors = _run_task(
            &fixture.task,
            &hosts,
            fixture.factory.clone(),
            fixture.reporter.clone(),
        )
        .await
        .unwrap_err();

        assert_eq!(2, errors.len());
        assert_eq!("b", errors[0].0);
        assert_eq!("c", errors[1].0);
    }

    #[tokio::test]
    async fn returns_ok() {
        let fixture = Fixture::new();
        let hosts = vec!["a".to_string()];
        assert!(_run_task(
            &fixture.task,
            &hosts,
            fixture.factory.clone(),
            fixture.reporter.clone(),
        )
        .await
        .is_ok());
    }
}

mod run_host_task {
    use super::*;

    #[tokio::test]
    async fn connects_to_host() {
        let fixture = Fixture::new();
        fixture.run_host_task().await.unwrap();
        assert_eq!(vec!["app1".to_owned()], fixture.factory().hosts_seen());
    }

    #[tokio::test]
    async fn returns_error_if_fails_to_connect() {
        let fixture = Fixture::new();
        fixture.factory().set_unreachable(&fixture.host);
        assert!(fixture.run_host_task().await.is_err());
    }

    #[tokio::test]
    async fn runs_all_steps_in_order() {
        let fixture = Fixture::new();
        fixture.run_host_task().await.unwrap();
        assert_eq!(
            vec!["echo one".to_owned(), "echo two".to_owned()],
            fixture.recorded_lines(),
        );
    }

    #[tokio::test]
    async fn skips_steps_whose_precondition_holds() {
        let fixture = Fixture::with_steps(vec![Step::sudo_unless(
            "mkdir -p /srv/app",
            Precondition::PathPresent("/srv/app".to_owned()),
        )]);
        fixture.factory().mark_path_present("/srv/app");

        fixture.run_host_task().await.unwrap();

        assert_eq!(vec!["test -e /srv/app".to_owned()], fixture.recorded_lines());
        assert!(fixture.reporter.stdout().contains("Skipped"));
    }

    #[tokio::test]
    async fn runs_guarded_steps_whose_precondition_does_not_hold() {
        let fixture = Fixture::with_steps(vec![Step::sudo_unless(
            "mkdir -p /srv/app",
            Precondition::PathPresent("/srv/app".to_owned()),
        )]);

        fixture.run_host_task().await.unwrap();

        assert_eq!(
            vec!["test -e /srv/app".to_owned(), "mkdir -p /srv/app".to_owned()],
            fixture.recorded_lines(),
        );
    }

    #[tokio::test]
    async fn line_preconditions_probe_with_grep() {
        let line = "LANG=\"en_US.UTF-8\"";
        let fixture = Fixture::with_steps(vec![Step::sudo_unless(
            format!("echo '{line}' >> /etc/default/locale"),
            Precondition::LinePresent {
                pattern: line.to_owned(),
                path: "/etc/default/locale".to_owned(),
            },
        )]);
        fixture
            .factory()
            .mark_line_present(line, "/etc/default/locale");

        fixture.run_host_task().await.unwrap();

        let lines = fixture.recorded_lines();
        assert_eq!(1, lines.len());
        assert!(lines[0].starts_with("grep -q "));
    }

    #[tokio::test]
    async fn strict_failure_aborts_remaining_steps() {
        let fixture = Fixture::new();
        fixture.factory().fail_matching("echo one");

        let error = fixture.run_host_task().await.unwrap_err();

        assert_eq!(vec!["echo one".to_owned()], fixture.recorded_lines());
        assert!(error.to_string().contains("failed at step"));
        assert!(error.downcast_ref::<RemoteExecutionError>().is_some());
    }

    #[tokio::test]
    async fn reports_steps() {
        let fixture = Fixture::new();
        fixture.run_host_task().await.unwrap();
        assert!(fixture.reporter.stdout().contains("Starting "));
        assert!(fixture.reporter.stdout().contains("Completed "));
    }

    #[tokio::test]
    async fn returns_error_if_reporting_fails() {
        let fixture = Fixture::new();
        fixture.reporter.fail();
        assert!(fixture.run_host_task().await.is_err());
    }

    #[tokio::test]
    async fn returns_ok() {
        assert!(Fixture::new().run_host_task().await.is_ok());
    }
}

mod install {
    use super::*;

    fn artifact() -> Artifact {
        Artifact {
            content: "{\"bind\": \"127.0.0.1:8080\"}".to_owned(),
            dest: "/srv/app/config.json".to_owned(),
            owner: "www-data".to_owned(),
            group: "www-data".to_owned(),
            mode: "600".to_owned(),
            elevated: true,
        }
    }

    #[tokio::test]
    async fn stages_moves_chowns_and_chmods_in_order() {
        let fixture = Fixture::with_steps(vec![Step::Install {
            artifact: artifact(),
            unless: None,
        }]);

        fixture.run_host_task().await.unwrap();

        let commands = fixture.recorded_commands();
        let expected = [
            ("run", "mktemp", false),
            ("upload", "/tmp/stevedore-stage", false),
            ("run", "mv /tmp/stevedore-stage /srv/app/config.json", true),
            ("run", "chown www-data:www-data /srv/app/config.json", true),
            ("run", "chmod 600 /srv/app/config.json", true),
        ];
        assert_eq!(expected.len(), commands.len());
        for (record, (method_name, line, elevated)) in commands.iter().zip(expected) {
            assert_eq!(method_name, record.method_name);
            assert_eq!(line, record.line);
            assert_eq!(elevated, record.elevated);
        }
    }

    #[tokio::test]
    async fn unelevated_artifacts_install_without_privilege() {
        let mut unprivileged = artifact();
        unprivileged.elevated = false;
        let fixture = Fixture::with_steps(vec![Step::Install {
            artifact: unprivileged,
            unless: None,
        }]);

        fixture.run_host_task().await.unwrap();

        assert!(fixture
            .recorded_commands()
            .iter()
            .all(|record| !record.elevated));
    }

    #[tokio::test]
    async fn first_failing_sub_step_aborts_the_rest() {
        let fixture = Fixture::with_steps(vec![Step::Install {
            artifact: artifact(),
            unless: None,
        }]);
        fixture.factory().fail_matching("chown");

        assert!(fixture.run_host_task().await.is_err());

        let lines = fixture.recorded_lines();
        assert!(lines.iter().any(|line| line.starts_with("chown")));
        assert!(!lines.iter().any(|line| line.starts_with("chmod")));
    }

    #[tokio::test]
    async fn precondition_skips_the_entire_install() {
        let fixture = Fixture::with_steps(vec![Step::Install {
            artifact: artifact(),
            unless: Some(Precondition::PathPresent("/srv/app/config.json".to_owned())),
        }]);
        fixture.factory().mark_path_present("/srv/app/config.json");

        fixture.run_host_task().await.unwrap();

        assert_eq!(
            vec!["test -e /srv/app/config.json".to_owned()],
            fixture.recorded_lines(),
        );
    }
}

mod checkout {
    use super::*;

    fn step() -> Step {
        Step::Checkout {
            repository: "git@git.example.com:acme/app.git".to_owned(),
            dest: "/srv/gopath/src/app".to_owned(),
            branch: "master".to_owned(),
        }
    }

    #[tokio::test]
    async fn clones_when_the_destination_is_missing() {
        let fixture = Fixture::with_steps(vec![step()]);

        fixture.run_host_task().await.unwrap();

        let lines = fixture.recorded_lines();
        assert_eq!(
            vec![
                "test -e /srv/gopath/src/app".to_owned(),
                "git clone git@git.example.com:acme/app.git /srv/gopath/src/app \
                && cd /srv/gopath/src/app && git checkout master"
                    .to_owned(),
            ],
            lines,
        );
    }

    #[tokio::test]
    async fn updates_when_the_checkout_exists() {
        let fixture = Fixture::with_steps(vec![step()]);
        {
            let mut factory = fixture.factory();
            factory.mark_path_present("/srv/gopath/src/app");
            factory.mark_path_present("/srv/gopath/src/app/.git");
        }

        fixture.run_host_task().await.unwrap();

        let lines = fixture.recorded_lines();
        assert!(!lines.iter().any(|line| line.contains("git clone")));
        assert!(lines.contains(
            &"cd /srv/gopath/src/app && git reset --hard && git checkout master \
            && git pull --ff-only"
                .to_owned()
        ));
    }

    #[tokio::test]
    async fn rejects_a_destination_that_is_not_a_checkout() {
        let fixture = Fixture::with_steps(vec![step()]);
        fixture.factory().mark_path_present("/srv/gopath/src/app");

        let error = fixture.run_host_task().await.unwrap_err();

        assert!(error.to_string().contains("failed at step"));
        assert!(!fixture
            .recorded_lines()
            .iter()
            .any(|line| line.contains("git ")));
    }
}

mod build {
    use super::*;

    #[tokio::test]
    async fn exports_env_and_runs_in_the_working_directory() {
        let fixture = Fixture::with_steps(vec![Step::Build {
            dir: "/srv/gopath/src/app".to_owned(),
            command: "go install".to_owned(),
            env: vec![("GOPATH".to_owned(), "/srv/gopath".to_owned())],
        }]);

        fixture.run_host_task().await.unwrap();

        assert_eq!(
            vec!["cd /srv/gopath/src/app && export GOPATH=/srv/gopath && go install".to_owned()],
            fixture.recorded_lines(),
        );
    }

    #[tokio::test]
    async fn build_failure_is_fatal() {
        let fixture = Fixture::with_steps(vec![
            Step::Build {
                dir: "/srv/gopath/src/app".to_owned(),
                command: "go install".to_owned(),
                env: vec![],
            },
            Step::run("echo never"),
        ]);
        fixture.factory().fail_matching("go install");

        assert!(fixture.run_host_task().await.is_err());
        assert!(!fixture.recorded_lines().contains(&"echo never".to_owned()));
    }
}

mod lifecycle {
    use super::*;

    fn service() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "app-server".to_owned(),
            log: "/srv/logs/app-server.log".to_owned(),
        }
    }

    #[tokio::test]
    async fn stops_then_starts_unconditionally() {
        let fixture = Fixture::with_steps(vec![Step::Stop(service()), Step::Start(service())]);

        fixture.run_host_task().await.unwrap();

        assert_eq!(
            vec![
                "systemctl stop app-server".to_owned(),
                "systemctl start app-server".to_owned(),
            ],
            fixture.recorded_lines(),
        );
        assert!(fixture
            .recorded_commands()
            .iter()
            .all(|record| record.elevated));
    }

    #[tokio::test]
    async fn stop_failure_is_a_warning_not_an_error() {
        let fixture = Fixture::with_steps(vec![Step::Stop(service()), Step::Start(service())]);
        fixture.factory().fail_matching("systemctl stop");

        fixture.run_host_task().await.unwrap();

        // The failed stop is reported, and the start still runs.
        assert!(fixture.reporter.stderr().contains("Warning"));
        assert!(fixture
            .recorded_lines()
            .contains(&"systemctl start app-server".to_owned()));
    }

    #[tokio::test]
    async fn start_failure_is_fatal() {
        let fixture = Fixture::with_steps(vec![Step::Start(service())]);
        fixture.factory().fail_matching("systemctl start");

        let error = fixture.run_host_task().await.unwrap_err();
        assert!(error.downcast_ref::<RemoteExecutionError>().is_some());
    }
}

mod certificate {
    use super::*;

    fn bundle() -> CertificateBundle {
        CertificateBundle::for_domain("/srv/ssl", "app.example.com")
    }

    #[tokio::test]
    async fn generates_key_and_csr_then_halts_when_no_csr_exists() {
        let fixture = Fixture::with_steps(vec![
            Step::Certificate(bundle()),
            Step::run("echo never"),
        ]);

        fixture.run_host_task().await.unwrap();

        let lines = fixture.recorded_lines();
        assert!(lines.iter().any(|line| line.starts_with("openssl req")));
        assert!(!lines.iter().any(|line| line.starts_with("chmod")));
        // The halt stops the remaining steps without failing the task.
        assert!(!lines.contains(&"echo never".to_owned()));
        assert!(fixture.reporter.stdout().contains("Halted:"));
    }

    #[tokio::test]
    async fn tightens_permissions_when_the_csr_exists() {
        let fixture = Fixture::with_steps(vec![Step::Certificate(bundle())]);
        fixture
            .factory()
            .mark_path_present("/srv/ssl/app.example.com.csr");

        fixture.run_host_task().await.unwrap();

        let lines = fixture.recorded_lines();
        assert!(!lines.iter().any(|line| line.starts_with("openssl req")));
        assert!(lines.contains(&"chmod 400 /srv/ssl/app.example.com.key".to_owned()));
        assert!(lines.contains(&"chmod 400 /srv/ssl/app.example.com.crt".to_owned()));
    }

    #[tokio::test]
    async fn missing_certificate_fails_phase_two() {
        let fixture = Fixture::with_steps(vec![Step::Certificate(bundle())]);
        {
            let mut factory = fixture.factory();
            factory.mark_path_present("/srv/ssl/app.example.com.csr");
            factory.fail_matching("chmod 400 /srv/ssl/app.example.com.crt");
        }

        assert!(fixture.run_host_task().await.is_err());
    }
}

mod check_proxy {
    use super::*;

    fn steps() -> Vec<Step> {
        vec![
            Step::CheckProxy {
                command: RemoteCommand::elevated("nginx -t -c /etc/nginx/nginx.conf"),
                failure_marker: "test failed".to_owned(),
            },
            Step::sudo("nginx -s reload"),
        ]
    }

    #[tokio::test]
    async fn reloads_when_the_test_passes() {
        let fixture = Fixture::with_steps(steps());
        fixture.factory().respond(ScriptedResponse {
            pattern: "nginx -t".to_owned(),
            exit_code: 0,
            stdout: String::new(),
            stderr: "nginx: configuration file /etc/nginx/nginx.conf test is successful\n"
                .to_owned(),
        });

        fixture.run_host_task().await.unwrap();

        assert!(fixture
            .recorded_lines()
            .contains(&"nginx -s reload".to_owned()));
    }

    #[tokio::test]
    async fn aborts_before_reload_when_the_marker_appears() {
        let fixture = Fixture::with_steps(steps());
        fixture.factory().respond(ScriptedResponse {
            pattern: "nginx -t".to_owned(),
            exit_code: 0,
            stdout: String::new(),
            stderr: "nginx: configuration file /etc/nginx/nginx.conf test failed\n".to_owned(),
        });

        let error = fixture.run_host_task().await.unwrap_err();

        let validation = error.downcast_ref::<ValidationError>().unwrap();
        assert!(validation.diagnostic.contains("test failed"));
        assert!(!fixture
            .recorded_lines()
            .contains(&"nginx -s reload".to_owned()));
    }

    #[tokio::test]
    async fn aborts_before_reload_on_a_non_zero_exit() {
        let fixture = Fixture::with_steps(steps());
        fixture.factory().respond(ScriptedResponse {
            pattern: "nginx -t".to_owned(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "nginx: [emerg] unknown directive \"serve\"\n".to_owned(),
        });

        let error = fixture.run_host_task().await.unwrap_err();

        let validation = error.downcast_ref::<ValidationError>().unwrap();
        assert!(validation.diagnostic.contains("unknown directive"));
        assert!(!fixture
            .recorded_lines()
            .contains(&"nginx -s reload".to_owned()));
    }
}

mod idempotence {
    use super::*;

    // Runs the backend deploy task twice against the same simulated host. The first
    // run provisions; the second must not create directories or clone again, while
    // the build and the stop/start cycle still execute.
    #[tokio::test]
    async fn second_server_deploy_repeats_no_provisioning() {
        let context = context();
        let mut fixture = Fixture::new();
        fixture.task = tasks::task("server", &context).unwrap();

        fixture.run_host_task().await.unwrap();
        let first: Vec<String> = fixture.recorded_lines();
        assert!(first.iter().any(|line| line.contains("git clone")));
        assert!(first.iter().any(|line| line.starts_with("mkdir -p")));

        fixture.run_host_task().await.unwrap();
        let both = fixture.recorded_lines();
        let second = &both[first.len()..];

        assert!(!second.iter().any(|line| line.contains("git clone")));
        assert!(!second.iter().any(|line| line.starts_with("mkdir -p")));

        // Builds have no idempotence contract of their own, and the lifecycle cycle
        // is unconditional.
        assert!(second.iter().any(|line| line.contains("go install")));
        assert!(second
            .iter()
            .any(|line| line.contains("systemctl stop app-server")));
        assert!(second
            .iter()
            .any(|line| line.contains("systemctl start app-server")));
    }

    // A host with everything in place sees probes and the steps that re-run by
    // design, but no directory creation and no clone.
    #[tokio::test]
    async fn provisioned_host_sees_no_duplicate_provisioning() {
        let context = context();
        let mut fixture = Fixture::new();
        fixture.task = tasks::task("config", &context).unwrap();
        fixture.factory().mark_path_present(&context.project_path);

        fixture.run_host_task().await.unwrap();

        assert!(!fixture
            .recorded_lines()
            .iter()
            .any(|line| line.starts_with("mkdir")));
    }
}
