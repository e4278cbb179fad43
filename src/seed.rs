//! Cloud-init seed media.
//!
//! The seed is a small ISO 9660 image labelled `cidata` holding
//! `user-data` and `meta-data`, mastered by an external tool. Builds are
//! keyed by a fingerprint of the inputs: an image whose recorded
//! fingerprint still matches is reused as-is.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio_util::sync::CancellationToken;

use crate::error::FleetError;
use crate::paths;

/// Interchangeable ISO mastering programs, in preference order.
pub const ISO_TOOL_CANDIDATES: [&str; 2] = ["mkisofs", "genisoimage"];

const VOLUME_LABEL: &str = "cidata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoTool {
    program: PathBuf,
}

impl IsoTool {
    pub fn at(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Search `PATH` for the first available candidate.
    pub fn detect() -> Option<Self> {
        let path = std::env::var_os("PATH")?;
        let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
        ISO_TOOL_CANDIDATES.iter().find_map(|name| {
            dirs.iter()
                .map(|d| d.join(name))
                .find(|p| p.is_file())
                .map(Self::at)
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn master(
        &self,
        output: &Path,
        files: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(), FleetError> {
        let program = self.program.display().to_string();
        let child = tokio::process::Command::new(&self.program)
            .arg("-output")
            .arg(output)
            .args(["-volid", VOLUME_LABEL, "-joliet", "-rock"])
            .args(files)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FleetError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Dropping the wait future drops the child, which kills it.
        let result = tokio::select! {
            result = child.wait_with_output() => result.map_err(|source| FleetError::Io {
                context: format!("waiting for {program}"),
                source,
            })?,
            _ = cancel.cancelled() => {
                return Err(FleetError::Cancelled {
                    what: format!("building seed image {}", output.display()),
                });
            }
        };
        if !result.status.success() {
            return Err(FleetError::SeedBuild {
                program,
                path: output.display().to_string(),
                code: result.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// A seed image on disk and the fingerprint it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedMedia {
    pub path: PathBuf,
    pub fingerprint: String,
}

/// Short hash of the seed inputs.
pub fn fingerprint(name: &str, user_data: &str, meta_data: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    user_data.hash(&mut hasher);
    meta_data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[derive(Debug, Clone)]
pub struct SeedMediaBuilder {
    state_dir: PathBuf,
    tool: Option<IsoTool>,
    cancel: CancellationToken,
}

impl SeedMediaBuilder {
    pub fn new(state_dir: impl Into<PathBuf>, tool: Option<IsoTool>) -> Self {
        Self {
            state_dir: state_dir.into(),
            tool,
            cancel: CancellationToken::new(),
        }
    }

    /// Kill an in-flight mastering run when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builder using whichever ISO tool is on `PATH`, if any.
    pub fn detect(state_dir: impl Into<PathBuf>) -> Self {
        Self::new(state_dir, IsoTool::detect())
    }

    pub fn tool(&self) -> Result<&IsoTool, FleetError> {
        self.tool.as_ref().ok_or_else(|| FleetError::ToolingUnavailable {
            candidates: ISO_TOOL_CANDIDATES.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// The media a VM owns, whether or not it has been built.
    pub fn media_for(&self, name: &str) -> SeedMedia {
        let fingerprint =
            std::fs::read_to_string(paths::seed_fingerprint_path(&self.state_dir, name))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
        SeedMedia {
            path: paths::seed_path(&self.state_dir, name),
            fingerprint,
        }
    }

    /// Build the seed image for `name`, or reuse the existing one when its
    /// inputs are unchanged.
    pub async fn build(
        &self,
        name: &str,
        user_data: &str,
        meta_data: &str,
    ) -> Result<SeedMedia, FleetError> {
        let fp = fingerprint(name, user_data, meta_data);
        let media = SeedMedia {
            path: paths::seed_path(&self.state_dir, name),
            fingerprint: fp.clone(),
        };
        let fp_path = paths::seed_fingerprint_path(&self.state_dir, name);

        let recorded = tokio::fs::read_to_string(&fp_path).await.unwrap_or_default();
        if recorded.trim() == fp && media.path.exists() {
            tracing::debug!(name, fingerprint = %fp, "seed media unchanged, reusing");
            return Ok(media);
        }

        let tool = self.tool()?;

        let staging = paths::seed_staging_dir(&self.state_dir, name);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|source| FleetError::Io {
                context: format!("creating directory {}", staging.display()),
                source,
            })?;

        let files = [
            (staging.join("user-data"), user_data),
            (staging.join("meta-data"), meta_data),
        ];
        for (path, contents) in &files {
            tokio::fs::write(path, contents)
                .await
                .map_err(|source| FleetError::Io {
                    context: format!("writing {}", path.display()),
                    source,
                })?;
        }

        // Drop the fingerprint first so an interrupted build is never reused.
        remove_if_present(&fp_path).await;
        remove_if_present(&media.path).await;

        let inputs: Vec<PathBuf> = files.iter().map(|(p, _)| p.clone()).collect();
        tracing::debug!(name, tool = %tool.program().display(), "mastering seed image");
        if let Err(e) = tool.master(&media.path, &inputs, &self.cancel).await {
            remove_if_present(&media.path).await;
            return Err(e);
        }

        tokio::fs::write(&fp_path, &fp)
            .await
            .map_err(|source| FleetError::Io {
                context: format!("writing {}", fp_path.display()),
                source,
            })?;

        tracing::info!(name, path = %media.path.display(), "built cloud-init seed media");
        Ok(media)
    }

    /// Remove the image, its fingerprint and staging files. Never fails;
    /// problems are logged.
    pub async fn destroy(&self, media: &SeedMedia) {
        let Some(dir) = media.path.parent() else {
            return;
        };
        remove_if_present(&media.path).await;
        remove_if_present(&dir.join("seed.fingerprint")).await;
        let staging = dir.join("seed");
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %staging.display(), error = %e, "failed to remove seed staging dir");
        }
        tracing::debug!(path = %media.path.display(), "seed media released");
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// A stand-in ISO tool: writes a marker to `-output` and counts runs.
    #[cfg(unix)]
    pub fn fake_iso_tool(dir: &Path) -> IsoTool {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-mkisofs");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             out=\"\"\n\
             while [ $# -gt 0 ]; do\n\
             \x20 if [ \"$1\" = \"-output\" ]; then out=\"$2\"; shift; fi\n\
             \x20 shift\n\
             done\n\
             printf 'ISO' > \"$out\"\n\
             echo run >> \"$(dirname \"$0\")/runs\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        IsoTool::at(script)
    }

    fn runs(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn fingerprint_tracks_every_input() {
        let base = fingerprint("web", "ud", "md");
        assert_eq!(base, fingerprint("web", "ud", "md"));
        assert_eq!(base.len(), 16);
        assert_ne!(base, fingerprint("db", "ud", "md"));
        assert_ne!(base, fingerprint("web", "ud2", "md"));
        assert_ne!(base, fingerprint("web", "ud", "md2"));
    }

    #[tokio::test]
    async fn missing_tool_is_tooling_unavailable() {
        let state = tempfile::tempdir().unwrap();
        let builder = SeedMediaBuilder::new(state.path(), None);
        let err = builder.build("web", "ud", "md").await.unwrap_err();
        assert!(matches!(err, FleetError::ToolingUnavailable { .. }));
        assert!(!paths::seed_path(state.path(), "web").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn build_writes_image_and_inputs() {
        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let builder = SeedMediaBuilder::new(state.path(), Some(fake_iso_tool(tools.path())));

        let media = builder.build("web", "#cloud-config\n", "instance-id: web\n").await.unwrap();
        assert_eq!(media.path, paths::seed_path(state.path(), "web"));
        assert_eq!(std::fs::read_to_string(&media.path).unwrap(), "ISO");
        let staged = paths::seed_staging_dir(state.path(), "web");
        assert_eq!(
            std::fs::read_to_string(staged.join("user-data")).unwrap(),
            "#cloud-config\n"
        );
        assert_eq!(builder.media_for("web"), media);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unchanged_inputs_are_not_rebuilt() {
        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let builder = SeedMediaBuilder::new(state.path(), Some(fake_iso_tool(tools.path())));

        builder.build("web", "ud", "md").await.unwrap();
        builder.build("web", "ud", "md").await.unwrap();
        assert_eq!(runs(tools.path()), 1);

        builder.build("web", "ud-changed", "md").await.unwrap();
        assert_eq!(runs(tools.path()), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_reports_seed_build_error() {
        use std::os::unix::fs::PermissionsExt;

        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let script = tools.path().join("broken-mkisofs");
        std::fs::write(&script, "#!/bin/sh\necho 'bad option' >&2\nexit 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let builder = SeedMediaBuilder::new(state.path(), Some(IsoTool::at(&script)));
        match builder.build("web", "ud", "md").await.unwrap_err() {
            FleetError::SeedBuild { code, stderr, .. } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "bad option");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!paths::seed_fingerprint_path(state.path(), "web").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_a_hung_tool() {
        use std::os::unix::fs::PermissionsExt;

        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let script = tools.path().join("slow-mkisofs");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cancel = CancellationToken::new();
        let builder = SeedMediaBuilder::new(state.path(), Some(IsoTool::at(&script)))
            .with_cancellation(cancel.clone());

        let started = std::time::Instant::now();
        let build = builder.build("web", "ud", "md");
        let trigger = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(build, trigger);

        assert!(matches!(result, Err(FleetError::Cancelled { .. })));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert!(!paths::seed_fingerprint_path(state.path(), "web").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn destroy_removes_everything_and_tolerates_absence() {
        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let builder = SeedMediaBuilder::new(state.path(), Some(fake_iso_tool(tools.path())));

        let media = builder.build("web", "ud", "md").await.unwrap();
        builder.destroy(&media).await;
        assert!(!media.path.exists());
        assert!(!paths::seed_fingerprint_path(state.path(), "web").exists());
        assert!(!paths::seed_staging_dir(state.path(), "web").exists());

        // second destroy is a no-op
        builder.destroy(&media).await;
    }
}
