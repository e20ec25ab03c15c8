//! Download-then-install of remote catalog packages.
//!
//! An install is reported as a stream of [`InstallStep`]s. The stream is
//! cold: nothing is downloaded until it is polled, and every call to
//! [`Installer::download_and_install`] starts a fresh operation. Dropping the
//! stream cancels the operation between phases. The downloaded package file
//! is removed on every exit path.

use anyhow::{Context, Result, bail};
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::Response;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::catalog::manifest::is_valid_pkg_name;
use crate::catalog::model::CatalogRemote;
use crate::catalog::package::PackageInstaller;

/// Phase of an install operation. `Installed` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStep {
    Pending,
    Downloading,
    Installing,
    Installed,
    Error(String),
}

impl InstallStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallStep::Installed | InstallStep::Error(_))
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStep::Pending => write!(f, "pending"),
            InstallStep::Downloading => write!(f, "downloading"),
            InstallStep::Installing => write!(f, "installing"),
            InstallStep::Installed => write!(f, "installed"),
            InstallStep::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// Progress of one install operation.
pub type InstallSteps = BoxStream<'static, InstallStep>;

type ActiveSet = Arc<Mutex<HashSet<String>>>;

/// Marks a package as being installed for as long as it is alive.
struct InstallClaim {
    active: ActiveSet,
    pkg_name: String,
}

impl InstallClaim {
    fn acquire(active: &ActiveSet, pkg_name: &str) -> Option<Self> {
        let mut set = active.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(pkg_name.to_string()) {
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
            pkg_name: pkg_name.to_string(),
        })
    }
}

impl Drop for InstallClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pkg_name);
    }
}

/// Everything one operation needs, owned by the stream.
struct InstallJob {
    client: reqwest::Client,
    packages: Arc<dyn PackageInstaller>,
    catalog: CatalogRemote,
    download_path: PathBuf,
    active: ActiveSet,
}

enum Phase {
    Start(InstallJob),
    Download(InstallJob),
    Save {
        job: InstallJob,
        claim: InstallClaim,
        file: TempPath,
        response: Response,
    },
    Install {
        job: InstallJob,
        claim: InstallClaim,
        file: TempPath,
    },
    Done,
}

/// Downloads packages and hands them to the package manager.
#[derive(Clone)]
pub struct Installer {
    client: reqwest::Client,
    packages: Arc<dyn PackageInstaller>,
    download_dir: PathBuf,
    active: ActiveSet,
}

impl Installer {
    pub fn new(
        client: reqwest::Client,
        packages: Arc<dyn PackageInstaller>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            packages,
            download_dir,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Deterministic temporary file for a package download.
    pub fn download_path(&self, pkg_name: &str) -> PathBuf {
        self.download_dir.join(format!("{}.apk", pkg_name))
    }

    /// Download and install `catalog`, reporting progress.
    ///
    /// Emits `Pending` before any I/O, `Downloading` once the server accepted
    /// the request, `Installing` once the package is on disk, then `Installed`
    /// or `Error`. Any failure ends the stream with `Error`.
    pub fn download_and_install(&self, catalog: CatalogRemote) -> InstallSteps {
        let job = InstallJob {
            client: self.client.clone(),
            packages: Arc::clone(&self.packages),
            download_path: self.download_path(&catalog.pkg_name),
            catalog,
            active: Arc::clone(&self.active),
        };

        stream::unfold(Phase::Start(job), advance).boxed()
    }

    /// Ask the package manager to uninstall `pkg_name`.
    pub async fn uninstall_apk(&self, pkg_name: &str) -> bool {
        let packages = Arc::clone(&self.packages);
        let pkg = pkg_name.to_string();
        match tokio::task::spawn_blocking(move || packages.uninstall(&pkg)).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                tracing::warn!(pkg_name = %pkg_name, "Uninstall failed: {:#}", e);
                false
            }
            Err(e) => {
                tracing::warn!(pkg_name = %pkg_name, "Uninstall task failed: {}", e);
                false
            }
        }
    }
}

async fn advance(phase: Phase) -> Option<(InstallStep, Phase)> {
    match phase {
        Phase::Start(job) => Some((InstallStep::Pending, Phase::Download(job))),

        Phase::Download(job) => {
            let Some(claim) = InstallClaim::acquire(&job.active, &job.catalog.pkg_name) else {
                return Some((
                    failed(&job, format!("{} is already being installed", job.catalog.pkg_name)),
                    Phase::Done,
                ));
            };
            // The guard exists before the file so any exit path removes it
            let file = TempPath::from_path(&job.download_path);
            match start_download(&job).await {
                Ok(response) => Some((
                    InstallStep::Downloading,
                    Phase::Save {
                        job,
                        claim,
                        file,
                        response,
                    },
                )),
                Err(e) => Some((failed(&job, format!("{:#}", e)), Phase::Done)),
            }
        }

        Phase::Save {
            job,
            claim,
            file,
            response,
        } => match save_body(response, &file).await {
            Ok(bytes) => {
                tracing::debug!(pkg_name = %job.catalog.pkg_name, bytes, "Package downloaded");
                Some((InstallStep::Installing, Phase::Install { job, claim, file }))
            }
            Err(e) => Some((failed(&job, format!("{:#}", e)), Phase::Done)),
        },

        Phase::Install { job, claim, file } => {
            let step = match install_file(&job, file).await {
                Ok(true) => {
                    tracing::info!(
                        pkg_name = %job.catalog.pkg_name,
                        version = %job.catalog.version_name,
                        "Catalog package installed"
                    );
                    InstallStep::Installed
                }
                Ok(false) => failed(&job, "Package manager rejected the package".to_string()),
                Err(e) => failed(&job, format!("{:#}", e)),
            };
            drop(claim);
            Some((step, Phase::Done))
        }

        Phase::Done => None,
    }
}

fn failed(job: &InstallJob, message: String) -> InstallStep {
    tracing::warn!(pkg_name = %job.catalog.pkg_name, "Install failed: {}", message);
    InstallStep::Error(message)
}

async fn start_download(job: &InstallJob) -> Result<Response> {
    if !is_valid_pkg_name(&job.catalog.pkg_name) {
        bail!("Invalid package name '{}'", job.catalog.pkg_name);
    }

    if let Some(parent) = job.download_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create download directory: {:?}", parent))?;
    }

    tracing::debug!(
        pkg_name = %job.catalog.pkg_name,
        url = %job.catalog.pkg_url,
        "Downloading package"
    );
    let response = job
        .client
        .get(&job.catalog.pkg_url)
        .header("Accept", "application/octet-stream")
        .send()
        .await
        .with_context(|| format!("Failed to download {}", job.catalog.pkg_url))?;

    let status = response.status();
    if !status.is_success() {
        bail!(
            "HTTP error: {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        );
    }

    Ok(response)
}

async fn save_body(response: Response, path: &Path) -> Result<u64> {
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {:?}", path))?;
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Download interrupted")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(written)
}

async fn install_file(job: &InstallJob, file: TempPath) -> Result<bool> {
    let packages = Arc::clone(&job.packages);
    let pkg_name = job.catalog.pkg_name.clone();
    // The file moves into the blocking task so it outlives the install
    // primitive even if the stream is dropped meanwhile
    tokio::task::spawn_blocking(move || {
        let accepted = packages.install(&file, &pkg_name);
        drop(file);
        accepted
    })
    .await
    .context("Install task failed")?
}
