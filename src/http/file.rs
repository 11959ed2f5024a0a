//! File-backed response bodies.
//!
//! File reads and writes run as child operations of the parent task, so
//! the handler returns before any disk I/O happens.

use std::io::SeekFrom;
use std::path::PathBuf;

use axum::http::{header, HeaderValue, StatusCode};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::http::content_type::mime_for_path;
use crate::http::form::MultipartBuilder;
use crate::http::response::{NOT_FOUND_PAGE, SERVICE_UNAVAILABLE_PAGE};
use crate::http::HttpResp;
use crate::observability::metrics;
use crate::subtask::{io_errno, TaskState};

/// Reported when the requested start lies at or past the end of the file.
#[derive(Debug)]
struct RangeNotSatisfiable {
    size: u64,
}

enum ReadOutcome {
    Content {
        data: Vec<u8>,
        start: u64,
        end: u64,
        size: u64,
    },
    Unsatisfiable(RangeNotSatisfiable),
    Failed(std::io::Error),
}

async fn read_range(path: &PathBuf, start: u64, end: Option<u64>) -> ReadOutcome {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => return ReadOutcome::Failed(e),
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return ReadOutcome::Failed(e),
    };
    let end = end.map_or(size, |e| e.min(size));
    if start > end || (size > 0 && start == end) {
        return ReadOutcome::Unsatisfiable(RangeNotSatisfiable { size });
    }

    if let Err(e) = file.seek(SeekFrom::Start(start)).await {
        return ReadOutcome::Failed(e);
    }
    let mut data = Vec::with_capacity((end - start) as usize);
    if let Err(e) = file.take(end - start).read_to_end(&mut data).await {
        return ReadOutcome::Failed(e);
    }
    ReadOutcome::Content {
        data,
        start,
        end,
        size,
    }
}

/// Attach a read of `path[start..end]`.
pub(crate) fn send_file(resp: &mut HttpResp, path: PathBuf, start: u64, end: Option<u64>) {
    let partial = start > 0 || end.is_some();
    let op_path = path.clone();
    resp.run(
        async move { read_range(&op_path, start, end).await },
        move |resp, outcome| match outcome {
            ReadOutcome::Content {
                data,
                start,
                end,
                size,
            } => {
                metrics::record_subtask("file", TaskState::Success);
                resp.set_header(header::CONTENT_TYPE, mime_for_path(&path));
                if partial && (start, end) != (0, size) {
                    resp.set_status(StatusCode::PARTIAL_CONTENT.as_u16());
                    let range = format!("bytes {}-{}/{}", start, end - 1, size);
                    resp.set_header(header::CONTENT_RANGE, &range);
                }
                resp.set_body_owned(data);
            }
            ReadOutcome::Unsatisfiable(RangeNotSatisfiable { size }) => {
                metrics::record_subtask("file", TaskState::TaskError);
                tracing::debug!(path = %path.display(), start, size, "Range not satisfiable");
                resp.set_status(StatusCode::RANGE_NOT_SATISFIABLE.as_u16());
                resp.set_header(header::CONTENT_RANGE, &format!("bytes */{}", size));
            }
            ReadOutcome::Failed(e) => {
                metrics::record_subtask("file", TaskState::SysError);
                tracing::warn!(path = %path.display(), error = %e, "File read failed");
                not_found(resp);
            }
        },
    );
}

/// Attach a read of every file in `paths`, replied as one multipart body.
pub(crate) fn send_files(resp: &mut HttpResp, paths: Vec<PathBuf>) {
    resp.run(
        async move {
            let mut files = Vec::with_capacity(paths.len());
            for path in paths {
                match tokio::fs::read(&path).await {
                    Ok(data) => files.push((path, data)),
                    Err(e) => return Err((path, e)),
                }
            }
            Ok(files)
        },
        |resp, outcome| match outcome {
            Ok(files) => {
                metrics::record_subtask("file", TaskState::Success);
                let mut builder = MultipartBuilder::new();
                let content_type = builder.content_type();
                for (idx, (path, data)) in files.iter().enumerate() {
                    let filename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let name = if idx == 0 {
                        "file".to_string()
                    } else {
                        format!("file{}", idx + 1)
                    };
                    builder = builder.file(&name, &filename, mime_for_path(path), data);
                }
                resp.set_header(header::CONTENT_TYPE, &content_type);
                resp.set_body_owned(builder.build());
            }
            Err((path, e)) => {
                metrics::record_subtask("file", TaskState::SysError);
                tracing::warn!(path = %path.display(), error = %e, "File read failed");
                not_found(resp);
            }
        },
    );
}

/// Attach a write of `content` to `dest`.
pub(crate) fn save_file(resp: &mut HttpResp, dest: PathBuf, content: Bytes) {
    let op_dest = dest.clone();
    resp.run(
        async move {
            if let Some(parent) = op_dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&op_dest, &content).await
        },
        move |resp, outcome: std::io::Result<()>| match outcome {
            Ok(()) => {
                metrics::record_subtask("file", TaskState::Success);
                resp.string("Save File success\n");
            }
            Err(e) => {
                metrics::record_subtask("file", TaskState::SysError);
                tracing::warn!(
                    path = %dest.display(),
                    error = %e,
                    errno = io_errno(&e),
                    "File save failed"
                );
                resp.set_status(StatusCode::SERVICE_UNAVAILABLE.as_u16());
                resp.set_header(header::CONTENT_TYPE, "text/html");
                resp.string(SERVICE_UNAVAILABLE_PAGE);
            }
        },
    );
}

fn not_found(resp: &mut HttpResp) {
    resp.set_status(StatusCode::NOT_FOUND.as_u16());
    resp.headers_mut().remove(header::CONTENT_RANGE);
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    resp.string(NOT_FOUND_PAGE);
}
