use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;
use tracing::warn;

use chunkup_engine::{
    EngineConfig, FileSource, FileUpload, RegistryEvent, SubmitOutcome, UploadStatus, UploadTask,
    Uploader,
};

pub async fn upload(config: EngineConfig, paths: &[PathBuf]) -> Result<()> {
    let uploader = Uploader::with_http(config)?;
    let progress = tokio::spawn(print_progress(uploader.subscribe()));

    let files = paths
        .iter()
        .map(|p| FileUpload::from_path(p).with_context(|| format!("opening {}", p.display())))
        .collect::<Result<Vec<_>>>()?;

    let mut ids = Vec::new();
    for outcome in uploader.submit(files) {
        match outcome {
            SubmitOutcome::Accepted { file_id } => ids.push(file_id),
            SubmitOutcome::Rejected { name, error } => eprintln!("{name}: rejected: {error}"),
        }
    }

    let failed = wait_or_pause(&uploader, &ids).await;
    progress.abort();
    if failed > 0 {
        bail!("{failed} upload(s) did not complete");
    }
    Ok(())
}

pub async fn list(config: EngineConfig) -> Result<()> {
    let uploader = Uploader::with_http(config)?;
    let tasks = uploader.restore().await?;
    if tasks.is_empty() {
        println!("no unfinished uploads");
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:>4}  {:>11}  NAME", "ID", "STATUS", "%", "CHUNKS");
    for task in &tasks {
        let chunks = format!("{}/{}", task.chunks_uploaded.len(), task.chunks_total);
        println!(
            "{:<36}  {:<10}  {:>4}  {:>11}  {}",
            task.file_id, task.status, task.progress, chunks, task.file_name
        );
        if let Some(error) = &task.error {
            println!("{:<36}  last error: {error}", "");
        }
    }
    Ok(())
}

pub async fn resume(config: EngineConfig, file_id: &str, path: &Path) -> Result<()> {
    let uploader = Uploader::with_http(config)?;
    uploader.restore().await?;

    let progress = tokio::spawn(print_progress(uploader.subscribe()));
    start_resume(&uploader, file_id, path).await?;

    let failed = wait_or_pause(&uploader, &[file_id.to_string()]).await;
    progress.abort();
    if failed > 0 {
        bail!("upload {file_id} did not complete");
    }
    Ok(())
}

/// Re-attaches `path` to a restored upload and continues it.
///
/// The server may hold fewer chunks than the local record says, so the file
/// is attached whenever it can be read. Only an upload whose every chunk is
/// recorded as uploaded may proceed without it.
async fn start_resume(uploader: &Uploader, file_id: &str, path: &Path) -> Result<()> {
    let Some(task) = uploader.snapshot(file_id) else {
        bail!("no unfinished upload with id {file_id}");
    };

    let attached = FileSource::open(path)
        .with_context(|| format!("opening {}", path.display()))
        .and_then(|source| Ok(uploader.attach_source(file_id, Arc::new(source))?));
    if let Err(e) = attached {
        if !task.all_chunks_uploaded() {
            return Err(e);
        }
        warn!(file_id, error = %e, "continuing without the file, all chunks are uploaded");
    }

    uploader.resume(file_id).await?;
    Ok(())
}

pub async fn cancel(config: EngineConfig, file_id: &str) -> Result<()> {
    let uploader = Uploader::with_http(config)?;
    uploader.restore().await?;
    match uploader.snapshot(file_id) {
        Some(task) if task.status.is_terminal() => uploader.clear_entry(file_id)?,
        Some(_) => uploader.cancel(file_id)?,
        None => bail!("no unfinished upload with id {file_id}"),
    }
    uploader.flush().await;
    println!("cancelled {file_id}");
    Ok(())
}

/// Waits for every upload in `ids`. Ctrl-C pauses whatever is still running
/// and saves its state. Returns how many uploads did not complete.
async fn wait_or_pause(uploader: &Uploader, ids: &[String]) -> usize {
    let waits = async {
        let mut failed = 0;
        for id in ids {
            match uploader.wait(id).await {
                Ok(record) => println!("{}: done, {}", record.name, record.url),
                Err(e) => {
                    failed += 1;
                    eprintln!("{id}: {e}");
                }
            }
        }
        failed
    };

    let failed = tokio::select! {
        failed = waits => failed,
        _ = tokio::signal::ctrl_c() => {
            let mut paused = 0;
            for id in ids {
                if uploader.pause(id).is_ok() {
                    paused += 1;
                }
            }
            eprintln!("interrupted, paused {paused} upload(s); run `chunkup list` to see them");
            paused
        }
    };
    uploader.flush().await;
    failed
}

async fn print_progress(mut events: broadcast::Receiver<RegistryEvent>) {
    let mut last: Option<(String, UploadStatus, u8)> = None;
    loop {
        match events.recv().await {
            Ok(RegistryEvent::Updated(task)) => {
                let key = (task.file_id.clone(), task.status, task.progress);
                if last.as_ref() != Some(&key) {
                    print_line(&task);
                    last = Some(key);
                }
            }
            Ok(RegistryEvent::Removed { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "progress display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_line(task: &UploadTask) {
    eprintln!(
        "{}: {} {:>3}% ({}/{} chunks)",
        task.file_name,
        task.status,
        task.progress,
        task.chunks_uploaded.len(),
        task.chunks_total
    );
}
