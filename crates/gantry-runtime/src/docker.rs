use crate::backend::{ContainerBackend, LogStream, RunOpts};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Container backend driving the `docker` command-line client.
///
/// Streaming transports (`stream_in` / `stream_out`) are implemented with
/// `docker cp` against a created-but-not-started container, so the engine may
/// live on a remote host without any shared filesystem.
pub struct DockerCliBackend {
    binary: String,
}

impl Default for DockerCliBackend {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
        }
    }
}

impl DockerCliBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn copy_in(&self, container: &str, opts: &RunOpts) -> Result<(), RuntimeError> {
        for (host_dir, container_path) in &opts.stream_in {
            let status = self
                .command()
                .args(["cp", &format!("{}/.", host_dir.display())])
                .arg(format!("{container}:{container_path}"))
                .status()?;
            if !status.success() {
                return Err(RuntimeError::Engine(format!(
                    "docker cp into {container}:{container_path} failed"
                )));
            }
        }
        Ok(())
    }

    fn copy_out(&self, container: &str, opts: &RunOpts) -> Result<(), RuntimeError> {
        for (container_path, host_dir) in &opts.stream_out {
            std::fs::create_dir_all(host_dir)?;
            let status = self
                .command()
                .arg("cp")
                .arg(format!("{container}:{container_path}/."))
                .arg(host_dir)
                .status()?;
            if !status.success() {
                return Err(RuntimeError::Engine(format!(
                    "docker cp out of {container}:{container_path} failed"
                )));
            }
        }
        Ok(())
    }
}

impl ContainerBackend for DockerCliBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn has_image(&self, image: &str) -> Result<bool, RuntimeError> {
        let output = self
            .command()
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .output()?;
        Ok(output.status.success())
    }

    fn run_in_container(
        &self,
        opts: &RunOpts,
        log: &mut dyn FnMut(LogStream, &str),
    ) -> Result<i32, RuntimeError> {
        if !self.has_image(&opts.image_name)? {
            return Err(RuntimeError::ImageNotFound(opts.image_name.clone()));
        }

        let mut cmd = self.command();
        cmd.args(["create", "--name", &opts.container_name]);
        for (host, container) in &opts.mounts {
            cmd.args(["-v", &format!("{}:{}", host.display(), container)]);
        }
        for volume in &opts.volumes {
            cmd.args(["-v", volume]);
        }
        if let Some(mode) = &opts.network_mode {
            cmd.args(["--network", mode]);
        }
        cmd.arg(&opts.image_name);
        cmd.args(&opts.cmd);

        let output = cmd.output()?;
        if !output.status.success() {
            return Err(RuntimeError::Engine(format!(
                "docker create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("created container {}", opts.container_name);

        self.copy_in(&opts.container_name, opts)?;

        let mut child = self
            .command()
            .args(["start", "--attach", &opts.container_name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take();
        let stderr_thread = stderr.map(|pipe| {
            std::thread::spawn(move || {
                BufReader::new(pipe)
                    .lines()
                    .map_while(Result::ok)
                    .collect::<Vec<_>>()
            })
        });
        if let Some(pipe) = child.stdout.take() {
            for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                log(LogStream::Stdout, &line);
            }
        }
        if let Some(handle) = stderr_thread {
            if let Ok(lines) = handle.join() {
                for line in &lines {
                    log(LogStream::Stderr, line);
                }
            }
        }
        let status = child.wait()?;
        let exit_code = status.code().unwrap_or(-1);

        if exit_code == 0 {
            self.copy_out(&opts.container_name, opts)?;
        }
        Ok(exit_code)
    }

    fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let output = self
            .command()
            .args(["rm", "--force", "--volumes", name])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Ok(());
            }
            warn!("docker rm {name} failed: {}", stderr.trim());
            return Err(RuntimeError::Engine(format!(
                "failed to remove container {name}: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn build_image(
        &self,
        image: &str,
        labels: &BTreeMap<String, String>,
        context_tar: &[u8],
    ) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["build", "--tag", image]);
        for (key, value) in labels {
            cmd.args(["--label", &format!("{key}={value}")]);
        }
        cmd.arg("-");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(context_tar)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(RuntimeError::Engine(format!(
                "docker build of {image} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
