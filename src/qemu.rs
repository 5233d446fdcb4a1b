//! Emulator harness: boot the finished image under QEMU.
//!
//! `run` is interactive on the serial console. `test` boots headless and
//! polls the file server's health endpoint through the forwarded port.

use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::artifact::ImageManifest;
use crate::error::BuildError;
use crate::features::BuildConfig;
use crate::layout::{HOST_FORWARD_PORT, SERVICE_PORT};

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// How the image is booted.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub iso: PathBuf,
    pub memory_mb: u32,
    pub host_port: u16,
    /// Serial log for headless boots; `None` means the console is on stdio.
    pub serial_log: Option<PathBuf>,
}

impl QemuConfig {
    pub fn new(iso: &Path, memory_mb: u32) -> Self {
        Self {
            iso: iso.to_path_buf(),
            memory_mb,
            host_port: HOST_FORWARD_PORT,
            serial_log: None,
        }
    }

    /// Size the VM from the manifest recorded with `iso`. Images without one
    /// fall back to the feature file at `features`.
    pub fn for_image(iso: &Path, features: &Path) -> Result<Self> {
        let memory_mb = match ImageManifest::read(iso)? {
            Some(manifest) => manifest.memory_mb,
            None => {
                tracing::warn!(
                    "No build manifest next to {}, sizing memory from {}",
                    iso.display(),
                    features.display()
                );
                BuildConfig::load(features).map_err(BuildError::from)?.memory_mb()
            }
        };
        Ok(Self::new(iso, memory_mb))
    }

    pub fn headless(mut self, serial_log: &Path) -> Self {
        self.serial_log = Some(serial_log.to_path_buf());
        self
    }

    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}/health", self.host_port)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-machine".into(),
            "accel=kvm:tcg".into(),
            "-m".into(),
            format!("{}M", self.memory_mb),
            "-cdrom".into(),
            self.iso.display().to_string(),
            "-boot".into(),
            "d".into(),
            "-netdev".into(),
            format!(
                "user,id=net0,hostfwd=tcp::{}-:{}",
                self.host_port, SERVICE_PORT
            ),
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
            "-no-reboot".into(),
        ];
        match &self.serial_log {
            Some(log) => {
                args.extend(["-display", "none", "-serial"].map(String::from));
                args.push(format!("file:{}", log.display()));
            }
            None => args.extend(["-nographic", "-serial", "mon:stdio"].map(String::from)),
        }
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(QEMU_BINARY);
        cmd.args(self.args());
        cmd
    }
}

fn require_image(iso: &Path) -> Result<()> {
    if !iso.is_file() {
        bail!(
            "Image not found at {}. Run 'monoboot build' first.",
            iso.display()
        );
    }
    Ok(())
}

fn spawn_error(e: std::io::Error) -> anyhow::Error {
    if e.kind() == ErrorKind::NotFound {
        BuildError::resource(format!("'{}' is not installed", QEMU_BINARY)).into()
    } else {
        anyhow::Error::new(e).context(format!("Failed to start {}", QEMU_BINARY))
    }
}

/// Boot interactively. Ctrl+A, X leaves the emulator.
pub fn run(config: &QemuConfig) -> Result<()> {
    require_image(&config.iso)?;
    tracing::info!(
        "Booting {} with {} MB, http://127.0.0.1:{}/ forwarded to the guest",
        config.iso.display(),
        config.memory_mb,
        config.host_port
    );
    println!("Press Ctrl+A, X to exit QEMU\n");

    let status = config.command().status().map_err(spawn_error)?;
    if !status.success() {
        bail!("QEMU exited with status: {}", status);
    }
    Ok(())
}

/// Kills the emulator when dropped.
struct VmGuard(Child);

impl Drop for VmGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Boot headless and wait for the health endpoint. Returns the time until
/// the service answered.
pub fn test(config: &QemuConfig, timeout: Duration) -> Result<Duration> {
    require_image(&config.iso)?;
    tracing::info!(
        "Smoke test: booting {} ({} MB), waiting up to {}s for {}",
        config.iso.display(),
        config.memory_mb,
        timeout.as_secs(),
        config.health_url()
    );

    let child = config
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(spawn_error)?;
    let mut vm = VmGuard(child);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = runtime.block_on(wait_for_health(
        &config.health_url(),
        timeout,
        Duration::from_secs(2),
        || match vm.0.try_wait() {
            Ok(Some(status)) => bail!("QEMU exited early with status: {}", status),
            Ok(None) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to poll QEMU")),
        },
    ));

    if result.is_err() {
        if let Some(log) = &config.serial_log {
            tracing::warn!("Serial console log: {}", log.display());
        }
    }
    result
}

/// Poll `url` until it answers 2xx, `timeout` passes, or `alive` fails.
pub async fn wait_for_health<F>(
    url: &str,
    timeout: Duration,
    interval: Duration,
    mut alive: F,
) -> Result<Duration>
where
    F: FnMut() -> Result<()>,
{
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("Failed to create HTTP client")?;

    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        alive()?;
        attempts += 1;
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let elapsed = start.elapsed();
                tracing::info!("{} answered after {:.1}s", url, elapsed.as_secs_f64());
                return Ok(elapsed);
            }
            Ok(resp) => tracing::debug!("{} returned {}", url, resp.status()),
            Err(e) => tracing::debug!("{} not reachable yet: {}", url, e),
        }
        if start.elapsed() + interval > timeout {
            bail!(
                "{} did not answer within {}s ({} attempts)",
                url,
                timeout.as_secs(),
                attempts
            );
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_args_forward_service_port() {
        let cfg = QemuConfig::new(Path::new("/out/monoboot.iso"), 1024);
        let args = cfg.args().join(" ");
        assert!(args.contains("-m 1024M"));
        assert!(args.contains("-cdrom /out/monoboot.iso"));
        assert!(args.contains("hostfwd=tcp::8080-:80"));
        assert!(args.contains("-serial mon:stdio"));

        let headless = cfg.headless(Path::new("/tmp/serial.log")).args().join(" ");
        assert!(headless.contains("-serial file:/tmp/serial.log"));
        assert!(!headless.contains("mon:stdio"));
    }

    #[test]
    fn test_memory_comes_from_the_built_image() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("monoboot.iso");
        let features = dir.path().join("features.env");
        // Edited after the build: the image itself has no database.
        std::fs::write(&features, "runtime=true\ndatabase=true\n").unwrap();
        let built = BuildConfig::default();
        ImageManifest::new(&built, "00")
            .stage(&iso)
            .unwrap()
            .commit(&crate::artifact::manifest_path(&iso))
            .unwrap();

        let cfg = QemuConfig::for_image(&iso, &features).unwrap();
        assert_eq!(cfg.memory_mb, built.memory_mb());
        assert_ne!(cfg.memory_mb, BuildConfig::load(&features).unwrap().memory_mb());
    }

    #[test]
    fn test_memory_falls_back_to_feature_file() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("monoboot.iso");
        let features = dir.path().join("features.env");
        std::fs::write(&features, "runtime=true\ndatabase=true\n").unwrap();

        let cfg = QemuConfig::for_image(&iso, &features).unwrap();
        let expected = BuildConfig::load(&features).unwrap().memory_mb();
        assert_eq!(cfg.memory_mb, expected);
    }

    #[test]
    fn test_missing_image() {
        let cfg = QemuConfig::new(Path::new("/nonexistent/monoboot.iso"), 256);
        assert!(run(&cfg).unwrap_err().to_string().contains("monoboot build"));
    }

    #[tokio::test]
    async fn test_health_poll_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/health", listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nok\n")
                    .await;
            }
        });

        let elapsed = wait_for_health(&url, Duration::from_secs(5), Duration::from_millis(50), || Ok(()))
            .await
            .unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_health_poll_times_out() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/health", port);
        let err = wait_for_health(&url, Duration::from_millis(300), Duration::from_millis(100), || Ok(()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not answer"));
    }

    #[tokio::test]
    async fn test_dead_vm_stops_polling() {
        let err = wait_for_health(
            "http://127.0.0.1:9/health",
            Duration::from_secs(30),
            Duration::from_millis(10),
            || bail!("QEMU exited early"),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exited early"));
    }
}
