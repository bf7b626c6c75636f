//! Instance bootstrap: packages, source checkout, TLS files and the systemd unit.
//!
//! Each step is recorded in the instance's [`BootstrapProgress`] as soon as it
//! completes, so re-running `up` only repeats what has not finished. A failed
//! instance does not stop the others.
//!
//! [`BootstrapProgress`]: crate::state::BootstrapProgress

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::remote::{shell_quote, Connector, RemoteCommand, RemoteError, RemoteExecutable};
use crate::report::BatchReport;
use crate::state::{ClusterDir, ClusterState, ServiceStatus};
use crate::template::{ClusterTemplate, TLS_CERT_FILE, TLS_KEY_FILE};

/// Where the deploy key is stored on instances, relative to the home directory.
pub const REMOTE_DEPLOY_KEY: &str = ".ssh/cluster-control-deploy";

/// Certificate and key contents read from the cluster template.
struct TlsFiles {
    dir: String,
    cert: Vec<u8>,
    key: Vec<u8>,
}

/// Prepares running instances to host the service.
pub struct Bootstrapper<'a> {
    dir: &'a ClusterDir,
    template: &'a ClusterTemplate,
    connector: &'a dyn Connector,
}

impl<'a> Bootstrapper<'a> {
    /// Bootstrapper for the instances of `template`.
    #[must_use]
    pub fn new(
        dir: &'a ClusterDir,
        template: &'a ClusterTemplate,
        connector: &'a dyn Connector,
    ) -> Self {
        Self {
            dir,
            template,
            connector,
        }
    }

    /// Bootstrap every instance that has not completed all steps.
    ///
    /// # Errors
    /// Returns an error only if state cannot be saved or a local key or
    /// certificate cannot be read; per-instance failures are in the report.
    pub async fn run(&self, state: &mut ClusterState) -> Result<BatchReport> {
        let deploy_key = if state.deploy_key.is_some() {
            let path = self.dir.deploy_key_file();
            Some(std::fs::read_to_string(&path).map_err(|e| Error::io("read", path, e))?)
        } else {
            None
        };
        let tls = self.read_tls()?;

        let mut report = BatchReport::new("bootstrap");
        for i in 0..state.instances.len() {
            if state.instances[i].bootstrap.is_complete() {
                debug!(instance = %state.instances[i].name, "Already bootstrapped");
                report.record(&state.instances[i], Ok(()));
                continue;
            }
            let result = self
                .bootstrap(state, i, deploy_key.as_deref(), tls.as_ref())
                .await?;
            report.record(&state.instances[i], result);
        }
        Ok(report)
    }

    async fn bootstrap(
        &self,
        state: &mut ClusterState,
        i: usize,
        deploy_key: Option<&str>,
        tls: Option<&TlsFiles>,
    ) -> Result<std::result::Result<(), RemoteError>> {
        let transport = match self.connector.connect(&state.instances[i]) {
            Ok(transport) => transport,
            Err(e) => return Ok(Err(e)),
        };
        let name = state.instances[i].name.clone();

        if let Err(e) = self.wait_for_ssh(transport.as_ref(), &name).await {
            return Ok(Err(e));
        }

        if !state.instances[i].bootstrap.packages {
            info!(instance = %name, "Installing packages");
            for command in self.package_commands() {
                if let Err(e) = transport.run(&command).await {
                    return Ok(Err(e));
                }
            }
            state.instances[i].bootstrap.packages = true;
            state.save(self.dir)?;
        }

        if !state.instances[i].bootstrap.repository {
            info!(instance = %name, repository = %self.template.service.repository.url, "Cloning repository");
            if let Some(key) = deploy_key {
                if let Err(e) = transport.run(&upload_deploy_key(key)).await {
                    return Ok(Err(e));
                }
            }
            if let Err(e) = transport.run(&self.clone_command(deploy_key.is_some())).await {
                return Ok(Err(e));
            }
            state.instances[i].bootstrap.repository = true;
            state.save(self.dir)?;
        }

        if !state.instances[i].bootstrap.tls {
            if let Some(files) = tls {
                info!(instance = %name, dir = %files.dir, "Uploading TLS certificate");
                for (file, contents) in [(TLS_CERT_FILE, &files.cert), (TLS_KEY_FILE, &files.key)] {
                    if let Err(e) = transport.run(&upload_private_file(&files.dir, file, contents)).await {
                        return Ok(Err(e));
                    }
                }
            }
            state.instances[i].bootstrap.tls = true;
            state.save(self.dir)?;
        }

        if !state.instances[i].bootstrap.service {
            info!(instance = %name, unit = %self.template.service.unit_name(), "Installing service");
            if let Err(e) = transport.run(&self.install_unit_command()).await {
                return Ok(Err(e));
            }
            state.instances[i].bootstrap.service = true;
            state.instances[i].service = ServiceStatus::Stopped;
            state.save(self.dir)?;
        }

        Ok(Ok(()))
    }

    async fn wait_for_ssh(
        &self,
        transport: &dyn RemoteExecutable,
        name: &str,
    ) -> std::result::Result<(), RemoteError> {
        let timeouts = self.template.timeouts;
        let probe = RemoteCommand::new("true").with_timeout(timeouts.ssh_ready().max(timeouts.poll_interval()));
        let start = Instant::now();
        loop {
            match transport.run(&probe).await {
                Ok(_) => {
                    debug!(instance = %name, "SSH ready");
                    return Ok(());
                }
                Err(e) if start.elapsed() >= timeouts.ssh_ready() => {
                    debug!(instance = %name, error = %e, "SSH never became ready");
                    return Err(RemoteError::Timeout(timeouts.ssh_ready_secs));
                }
                Err(e) => debug!(instance = %name, error = %e, "Waiting for SSH"),
            }
            tokio::time::sleep(timeouts.poll_interval()).await;
        }
    }

    fn read_tls(&self) -> Result<Option<TlsFiles>> {
        let (Some(tls), Some(dir)) = (&self.template.service.tls, self.template.service.tls_dir())
        else {
            return Ok(None);
        };
        let read = |path: &std::path::Path| std::fs::read(path).map_err(|e| Error::io("read", path, e));
        Ok(Some(TlsFiles {
            dir,
            cert: read(&tls.cert)?,
            key: read(&tls.key)?,
        }))
    }

    /// Repository setup scripts followed by the package install.
    fn package_commands(&self) -> Vec<RemoteCommand> {
        let service = &self.template.service;
        let timeout = self.template.timeouts.command();

        let mut commands: Vec<RemoteCommand> = service
            .package_repos
            .values()
            .map(|url| {
                RemoteCommand::new(format!("curl -fsSL {} | sudo bash -", shell_quote(url)))
                    .with_timeout(timeout)
            })
            .collect();

        if !service.packages.is_empty() {
            let packages: Vec<String> = service.packages.iter().map(|p| shell_quote(p)).collect();
            commands.push(
                RemoteCommand::new(format!("sudo yum install -y {}", packages.join(" ")))
                    .with_timeout(timeout),
            );
        }
        commands
    }

    /// Clone the repository unless a checkout already exists.
    fn clone_command(&self, with_deploy_key: bool) -> RemoteCommand {
        let repository = &self.template.service.repository;
        let dir = shell_quote(&repository.checkout_dir());
        let url = shell_quote(&repository.url);
        let branch = shell_quote(&repository.branch);

        let script = if with_deploy_key {
            let ssh = format!("ssh -i ~/{REMOTE_DEPLOY_KEY} -o StrictHostKeyChecking=accept-new");
            format!(
                "if [ ! -d {dir}/.git ]; then GIT_SSH_COMMAND='{ssh}' git clone --branch {branch} {url} {dir}; fi \
                 && git -C {dir} config core.sshCommand '{ssh}'"
            )
        } else {
            format!("if [ ! -d {dir}/.git ]; then git clone --branch {branch} {url} {dir}; fi")
        };
        RemoteCommand::new(script).with_timeout(self.template.timeouts.command())
    }

    fn install_unit_command(&self) -> RemoteCommand {
        let unit = self.template.service.unit_name();
        RemoteCommand::new(format!(
            "sudo tee /etc/systemd/system/{unit} > /dev/null \
             && sudo systemctl daemon-reload \
             && sudo systemctl enable {unit}"
        ))
        .with_stdin(render_unit(self.template))
        .with_timeout(self.template.timeouts.command())
    }
}

fn upload_deploy_key(private_key: &str) -> RemoteCommand {
    RemoteCommand::new(format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && cat > ~/{REMOTE_DEPLOY_KEY} && chmod 600 ~/{REMOTE_DEPLOY_KEY}"
    ))
    .with_stdin(private_key.as_bytes().to_vec())
}

/// Write `contents` to `dir/file` on the instance, readable by the owner only.
fn upload_private_file(dir: &str, file: &str, contents: &[u8]) -> RemoteCommand {
    let dir = shell_quote(dir);
    let path = format!("{dir}/{file}");
    RemoteCommand::new(format!(
        "umask 077 && mkdir -p {dir} && cat > {path} && chmod 600 {path}"
    ))
    .with_stdin(contents.to_vec())
}

/// Quote a value for a systemd unit file.
fn systemd_quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("\"{escaped}\"")
}

/// systemd unit running the service start command from its run directory.
#[must_use]
pub fn render_unit(template: &ClusterTemplate) -> String {
    let service = &template.service;
    let user = &template.instances.user;
    let home = format!("/home/{user}");
    let description = service.description.as_deref().unwrap_or(&service.name);

    let mut environment = vec![systemd_quote(&format!("PORT={}", service.port))];
    environment.extend(
        service
            .environment
            .iter()
            .map(|(k, v)| systemd_quote(&format!("{k}={v}"))),
    );

    format!(
        "[Unit]
Description={description}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
User={user}
WorkingDirectory={home}/{run_dir}
Environment={environment}
ExecStart=/bin/bash -lc {start}
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
",
        run_dir = service.run_dir(),
        environment = environment.join(" "),
        start = systemd_quote(&service.start),
    )
}
