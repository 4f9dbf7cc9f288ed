//! Request Classifier
//!
//! Decides what each framed request means and produces exactly one reply
//! for it. The only side effect on the hot path is `IngestBuffer::append`.
//!
//! | request | reply | connection |
//! |---|---|---|
//! | framing error | 400 (413 if too large) | closed |
//! | GET/HEAD on the status path | JSON status | open |
//! | any other non-POST | 400 | open |
//! | POST without `Content-Length` | 400 | closed |
//! | POST that is not an INSERT (when required) | 400 | open |
//! | POST with empty body | 202, buffer untouched | open |
//! | POST with body | 202 after append | open |

use std::sync::Arc;
use tracing::debug;

use codec::{response, Frame, FrameError, Reply};
use telemetry::{names, Telemetry};

use crate::buffer::IngestBuffer;
use crate::key;
use crate::stats::{HealthThresholds, ProxyStats};

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub status_path: String,
    pub thresholds: HealthThresholds,
    pub require_insert_query: bool,
}

#[derive(Debug)]
pub struct RequestClassifier {
    buffer: Arc<IngestBuffer>,
    stats: Arc<ProxyStats>,
    telemetry: Arc<dyn Telemetry>,
    settings: ClassifierSettings,
}

impl RequestClassifier {
    pub fn new(
        buffer: Arc<IngestBuffer>,
        stats: Arc<ProxyStats>,
        telemetry: Arc<dyn Telemetry>,
        settings: ClassifierSettings,
    ) -> Self {
        Self {
            buffer,
            stats,
            telemetry,
            settings,
        }
    }

    pub fn classify(&self, frame: Result<Frame<'_>, FrameError>) -> Reply {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return self.malformed(&e),
        };

        if !frame.is_post() {
            if frame.is_read() && frame.path() == self.settings.status_path {
                return self.status(frame.method == codec::frame::METHOD_GET);
            }
            debug!(method = frame.method, target = frame.target, "Unsupported method");
            return self.reject();
        }

        let Some(declared) = frame.content_length else {
            return self.malformed(&FrameError::malformed(format!(
                "{} {} without Content-Length",
                frame.method, frame.target
            )));
        };

        if self.settings.require_insert_query && !key::is_insert(frame.target) {
            debug!(target = frame.target, "Rejected non-insert query");
            return self.reject();
        }

        self.stats.record_accepted();
        self.telemetry.increment(names::RECEIVE);
        if declared > 0 {
            self.buffer.append(frame.target, frame.body);
        }
        Reply::keep(response::accepted())
    }

    fn reject(&self) -> Reply {
        self.stats.record_rejected();
        self.telemetry.increment(names::ERROR_400);
        Reply::keep(response::bad_request())
    }

    fn malformed(&self, error: &FrameError) -> Reply {
        debug!(error = %error, "Malformed request, closing connection");
        self.stats.record_malformed();
        self.telemetry.increment(names::ERROR_400);
        if error.is_too_large() {
            Reply::close(response::payload_too_large())
        } else {
            Reply::close(response::bad_request())
        }
    }

    fn status(&self, include_body: bool) -> Reply {
        let report = self.stats.status_report(&self.settings.thresholds);
        let code = report.status.http_status();
        Reply::keep(response::json(
            code,
            response::reason_phrase(code),
            &report.to_json(),
            include_body,
        ))
    }
}
