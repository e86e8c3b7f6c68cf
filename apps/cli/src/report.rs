//! Human-readable lines for upload events and results.

use chunkdrop_client::{UploadEvent, UploadOutcome};
use chunkdrop_protocol::types::UploadProgress;

pub fn event_line(event: &UploadEvent) -> Option<String> {
    let line = match event {
        UploadEvent::Prepared {
            upload_id,
            file_name,
            file_size,
            total_chunks,
            remaining,
            resumed,
        } => {
            if *resumed {
                format!(
                    "resuming {file_name} ({file_size} bytes) as {upload_id}: {remaining} of {total_chunks} chunks left"
                )
            } else {
                format!("uploading {file_name} ({file_size} bytes) as {upload_id}: {total_chunks} chunks")
            }
        }
        UploadEvent::Progress {
            percent,
            completed_chunks,
            total_chunks,
            ..
        } => format!("{percent:5.1}%  {completed_chunks}/{total_chunks} chunks"),
        UploadEvent::ChunkRetry {
            index,
            attempt,
            delay,
            error,
            ..
        } => format!(
            "chunk {index} attempt {attempt} failed ({error}), retrying in {}ms",
            delay.as_millis()
        ),
        UploadEvent::PassFinished { pass, failed, .. } if !failed.is_empty() => {
            format!("pass {pass} left {} chunk(s) unsent: {failed:?}", failed.len())
        }
        UploadEvent::PassFinished { .. } => return None,
        UploadEvent::Finalizing { .. } => "all chunks sent, finalizing".to_string(),
        UploadEvent::Completed { .. } => return None,
        UploadEvent::Failed { error, .. } => format!("upload stopped: {error}"),
    };
    Some(line)
}

pub fn outcome_line(outcome: &UploadOutcome) -> String {
    format!(
        "{} (upload {}, {} of {} chunks sent)",
        outcome.archive_id, outcome.upload_id, outcome.chunks_sent, outcome.total_chunks
    )
}

pub fn progress_line(progress: &UploadProgress) -> String {
    format!(
        "{}  {}  {:.1}%  {}/{} chunks  {}/{} bytes",
        progress.upload_id,
        progress.status.as_str(),
        progress.percentage(),
        progress.completed_chunks,
        progress.total_chunks,
        progress.transferred_bytes,
        progress.total_bytes
    )
}
