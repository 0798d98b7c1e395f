//! Session recording: a DevTools performance trace and screencast frames

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::page::{
    EventScreencastFrame, ScreencastFrameAckParams, StartScreencastFormat, StartScreencastParams,
    StopScreencastParams,
};
use chromiumoxide::cdp::browser_protocol::tracing::{
    EndParams, EventDataCollected, EventTracingComplete, StartParams, StartTransferMode, TraceConfig,
};
use chromiumoxide::listeners::EventStream;
use chromiumoxide::Page;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storycheck_common::{Result, ResultsDir};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{browser_error, SessionTasks};

const TRACE_CATEGORIES: &[&str] = &[
    "devtools.timeline",
    "disabled-by-default-devtools.screenshot",
    "v8.execute",
    "blink.user_timing",
    "loading",
];

/// Longest wait for buffered trace data after tracing ends
const TRACE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

const SCREENCAST_QUALITY: i64 = 70;

pub struct Recorder {
    trace_events: EventStream<EventDataCollected>,
    trace_complete: EventStream<EventTracingComplete>,
    screencast: bool,
}

impl Recorder {
    /// Start tracing, and the screencast when `record_video` is set.
    ///
    /// Trace data is buffered by the event streams held here and only read
    /// in [`Recorder::stop`].
    pub async fn start(
        page: &Page,
        results: &ResultsDir,
        record_video: bool,
        tasks: &SessionTasks,
    ) -> Result<Self> {
        let trace_events = page
            .event_listener::<EventDataCollected>()
            .await
            .map_err(browser_error)?;
        let trace_complete = page
            .event_listener::<EventTracingComplete>()
            .await
            .map_err(browser_error)?;

        let trace_config = TraceConfig::builder()
            .included_categories(TRACE_CATEGORIES.iter().map(|c| c.to_string()))
            .build();
        let params = StartParams::builder()
            .trace_config(trace_config)
            .transfer_mode(StartTransferMode::ReportEvents)
            .build();
        page.execute(params).await.map_err(browser_error)?;
        debug!("Tracing started");

        if record_video {
            start_screencast(page, results.videos_dir(), tasks).await?;
        }

        Ok(Self {
            trace_events,
            trace_complete,
            screencast: record_video,
        })
    }

    /// Stop recording and write the trace archive. Returns the number of
    /// trace events written.
    pub async fn stop(mut self, page: &Page, trace_path: &Path) -> Result<usize> {
        if self.screencast {
            if let Err(e) = page.execute(StopScreencastParams::default()).await {
                debug!("Stopping screencast: {}", e);
            }
        }

        page.execute(EndParams::default()).await.map_err(browser_error)?;

        let mut events: Vec<Value> = Vec::new();
        let collect = async {
            loop {
                tokio::select! {
                    Some(batch) = self.trace_events.next() => events.extend(batch.value.iter().cloned()),
                    _ = self.trace_complete.next() => break,
                    else => break,
                }
            }
        };
        if tokio::time::timeout(TRACE_FLUSH_TIMEOUT, collect).await.is_err() {
            warn!("Trace did not complete within {:?}; keeping what arrived", TRACE_FLUSH_TIMEOUT);
        }
        while let Some(Some(batch)) = self.trace_events.next().now_or_never() {
            events.extend(batch.value.iter().cloned());
        }

        write_trace_archive(trace_path, &events)?;
        info!("Trace with {} event(s) written to {}", events.len(), trace_path.display());
        Ok(events.len())
    }
}

async fn start_screencast(page: &Page, dir: PathBuf, tasks: &SessionTasks) -> Result<()> {
    tokio::fs::create_dir_all(&dir).await?;
    let mut frames = page
        .event_listener::<EventScreencastFrame>()
        .await
        .map_err(browser_error)?;

    let ack_page = page.clone();
    tasks.spawn(async move {
        let mut index: u64 = 0;
        while let Some(frame) = frames.next().await {
            if let Err(e) = ack_page
                .execute(ScreencastFrameAckParams::new(frame.session_id))
                .await
            {
                debug!("Screencast ack failed, stopping: {}", e);
                break;
            }
            let data: &str = frame.data.as_ref();
            match BASE64.decode(data) {
                Ok(bytes) => {
                    let path = dir.join(format!("frame_{:06}.jpg", index));
                    index += 1;
                    if let Err(e) = tokio::fs::write(&path, bytes).await {
                        warn!("Writing {}: {}", path.display(), e);
                    }
                }
                Err(e) => debug!("Undecodable screencast frame: {}", e),
            }
        }
    });

    let params = StartScreencastParams::builder()
        .format(StartScreencastFormat::Jpeg)
        .quality(SCREENCAST_QUALITY)
        .every_nth_frame(1)
        .build();
    page.execute(params).await.map_err(browser_error)?;
    debug!("Screencast started");
    Ok(())
}

/// Zip archive holding `trace.json` in the DevTools trace event format
pub fn write_trace_archive(path: &Path, events: &[Value]) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file("trace.json", options)?;
    zip.write_all(serde_json::to_string(&json!({ "traceEvents": events }))?.as_bytes())?;
    zip.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_trace_archive_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.zip");
        let events = vec![json!({"name": "Layout", "ph": "X"}), json!({"name": "Paint", "ph": "X"})];
        write_trace_archive(&path, &events).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut entry = archive.by_name("trace.json").unwrap();
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();

        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["traceEvents"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["traceEvents"][1]["name"], "Paint");
    }

    #[test]
    fn test_empty_trace_is_still_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.zip");
        write_trace_archive(&path, &[]).unwrap();
        let archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }
}
