//! Repair collaborator (§6.4): shells out to `ffmpeg` to remux a
//! structurally broken MP4 in place. Copies all streams without
//! re-encoding and moves the container index to the front (fast-start).

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{LoopcastError, LoopcastResult};

/// Attempts to repair `path` in place: probe, analyze, remux to a sibling
/// `.fixed.mp4`, then swap it in behind a `.bak` backup. On any failure
/// after the backup is created, the backup is restored and the temporary
/// file removed.
pub async fn repair(path: &Path) -> LoopcastResult<()> {
    probe_ffmpeg().await?;

    let fixed_path = sibling_with_suffix(path, "fixed.mp4");
    let bak_path = sibling_with_suffix(path, "bak");

    analyze(path).await;

    if let Err(e) = remux(path, &fixed_path).await {
        let _ = tokio::fs::remove_file(&fixed_path).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(path, &bak_path).await {
        let _ = tokio::fs::remove_file(&fixed_path).await;
        return Err(LoopcastError::RepairFailed(e.to_string()));
    }

    if let Err(e) = tokio::fs::rename(&fixed_path, path).await {
        let _ = tokio::fs::rename(&bak_path, path).await;
        return Err(LoopcastError::RepairFailed(e.to_string()));
    }

    Ok(())
}

async fn probe_ffmpeg() -> LoopcastResult<()> {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
        .map_err(|e| LoopcastError::RepairFailed(format!("ffmpeg not found: {e}")))?;
    Ok(())
}

/// Warnings-only analyze pass; output is captured only for logging.
async fn analyze(path: &Path) {
    let output = Command::new("ffmpeg")
        .args(["-v", "warning", "-i"])
        .arg(path)
        .arg("-f")
        .arg("null")
        .arg("-")
        .output()
        .await;

    if let Ok(output) = output {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!("ffmpeg analyze output for {}: {}", path.display(), stderr);
        }
    }
}

async fn remux(path: &Path, fixed_path: &Path) -> LoopcastResult<()> {
    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(path)
        .args(["-c", "copy", "-movflags", "faststart"])
        .arg(fixed_path)
        .output()
        .await
        .map_err(|e| LoopcastError::RepairFailed(e.to_string()))?;

    if !output.status.success() {
        return Err(LoopcastError::RepairFailed(format!(
            "ffmpeg remux exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_paths_append_suffix() {
        let path = Path::new("/videos/A.mp4");
        assert_eq!(
            sibling_with_suffix(path, "fixed.mp4"),
            PathBuf::from("/videos/A.mp4.fixed.mp4")
        );
        assert_eq!(
            sibling_with_suffix(path, "bak"),
            PathBuf::from("/videos/A.mp4.bak")
        );
    }
}
