//! Optional request log.
//!
//! The request log is enabled with the `--request-log` command-line option, or the
//! [`FlockDefault::RequestLog`](../config/enum.FlockDefault.html#variant.RequestLog)
//! default configuration option. When enabled, a logger task is launched and a channel
//! is provided to every [`FlockUser`](../behavior/struct.FlockUser.html), which sends a
//! copy of each [`RequestMetric`] it records. The logger uses Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html).
//!
//! The format is configured with `--request-format`:
//!  - `json` (the default): one JSON object per line;
//!  - `csv`: a header line, then one comma separated line per request;
//!  - `raw`: the [`Debug`](std::fmt::Debug) output of each request;
//!  - `pretty`: the pretty [`Debug`](std::fmt::Debug) output of each request.
//!
//! A json-formatted request looks like:
//! ```json
//! {"elapsed":1203,"error":"","final_url":"http://127.0.0.1:8080/api","method":"Get","name":"/api","redirected":false,"response_time":2,"status_code":200,"success":true,"url":"http://127.0.0.1:8080/api","user":0}
//! ```

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::FlockConfiguration;
use crate::metrics::RequestMetric;
use crate::FlockError;

/// The header of a csv-formatted request log.
const CSV_HEADER: &str =
    "elapsed,method,name,url,final_url,redirected,response_time,status_code,success,user,error";

/// Request log handle and channel, both set when the request log is enabled.
pub(crate) type RequestLogger = (
    Option<tokio::task::JoinHandle<Result<(), FlockError>>>,
    Option<flume::Sender<Option<RequestMetric>>>,
);

/// Supported log formats.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, EnumIter)]
pub enum LogFormat {
    Csv,
    Json,
    Raw,
    Pretty,
}
/// Allow setting log formats from the command line by implementing [`FromStr`].
impl FromStr for LogFormat {
    type Err = FlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Use a [`RegexSet`] to match string representations of `LogFormat`, returning
        // the appropriate enum value. Also match a wide range of abbreviations and
        // synonyms.
        let log_format = RegexSet::new([
            r"(?i)^csv$",
            r"(?i)^(json|jsn)$",
            r"(?i)^raw$",
            r"(?i)^pretty$",
        ])
        .expect("failed to compile log_format RegexSet");
        let matches = log_format.matches(s);
        if matches.matched(0) {
            Ok(LogFormat::Csv)
        } else if matches.matched(1) {
            Ok(LogFormat::Json)
        } else if matches.matched(2) {
            Ok(LogFormat::Raw)
        } else if matches.matched(3) {
            Ok(LogFormat::Pretty)
        } else {
            let valid = LogFormat::iter()
                .map(|f| format!("{:?}", f).to_lowercase())
                .collect::<Vec<String>>()
                .join(", ");
            Err(FlockError::InvalidOption {
                option: format!("LogFormat::{:?}", s),
                value: s.to_string(),
                detail: format!("Invalid log_format, expected: {}", valid),
            })
        }
    }
}

// Quote a csv field if it contains a separator, a quote or a line break.
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Manually create a csv row, as the csv format is a single line per request.
pub(crate) fn format_csv_row(request: &RequestMetric) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{}",
        request.elapsed,
        request.method,
        csv_field(&request.name),
        csv_field(&request.url),
        csv_field(&request.final_url),
        request.redirected,
        request.response_time,
        request.status_code,
        request.success,
        request.user,
        csv_field(&request.error),
    )
}

/// Format a request for the request log.
pub(crate) fn format_request(request: &RequestMetric, format: LogFormat) -> String {
    match format {
        LogFormat::Json => json!(request).to_string(),
        LogFormat::Csv => format_csv_row(request),
        LogFormat::Raw => format!("{:?}", request),
        LogFormat::Pretty => format!("{:#?}", request),
    }
}

impl FlockConfiguration {
    /// Create the request log file and launch the logger task, if the request log is
    /// enabled.
    ///
    /// The file is created before any user starts, so an unwritable path fails the
    /// load test before it begins.
    pub(crate) async fn setup_request_logger(&self) -> Result<RequestLogger, FlockError> {
        if self.request_log.is_empty() {
            return Ok((None, None));
        }

        let file = File::create(&self.request_log)
            .await
            .map_err(|e| FlockError::InvalidOption {
                option: "--request-log".to_string(),
                value: self.request_log.clone(),
                detail: format!("Failed to create request log: {}", e),
            })?;
        info!("writing requests to request_log: {}", &self.request_log);

        let (all_threads_logger_tx, logger_rx): (
            flume::Sender<Option<RequestMetric>>,
            flume::Receiver<Option<RequestMetric>>,
        ) = flume::unbounded();
        let format = self.request_format.unwrap_or(LogFormat::Json);
        let path = self.request_log.clone();
        let logger_handle = tokio::spawn(logger_main(path, file, format, logger_rx));

        Ok((Some(logger_handle), Some(all_threads_logger_tx)))
    }
}

/// Logger task, writes requests received from users until receiving `None` or until
/// all senders are dropped.
pub(crate) async fn logger_main(
    path: String,
    file: File,
    format: LogFormat,
    receiver: flume::Receiver<Option<RequestMetric>>,
) -> Result<(), FlockError> {
    // Allocate a 64K buffer.
    let mut request_log = BufWriter::with_capacity(64 * 1024, file);

    if format == LogFormat::Csv {
        request_log
            .write_all(format!("{}\n", CSV_HEADER).as_bytes())
            .await?;
    }

    while let Ok(Some(request)) = receiver.recv_async().await {
        let formatted_log = format_request(&request, format);
        if let Err(e) = request_log
            .write_all(format!("{}\n", formatted_log).as_bytes())
            .await
        {
            warn!("failed to write to {}: {}", &path, e);
        }
    }

    info!("flushing request_log: {}", &path);
    request_log.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::FlockMethod;

    fn request() -> RequestMetric {
        let mut request = RequestMetric::new(
            FlockMethod::Get,
            "/api",
            "http://127.0.0.1/api",
            1_203,
            3,
        );
        request.set_response_time(2);
        request.set_final_url("http://127.0.0.1/api");
        request
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!(LogFormat::from_str("csv").unwrap(), LogFormat::Csv);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("jsn").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("Raw").unwrap(), LogFormat::Raw);
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        match LogFormat::from_str("xml") {
            Err(FlockError::InvalidOption { detail, .. }) => {
                assert!(detail.contains("csv, json, raw, pretty"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn formats() {
        let mut request = request();
        let json: serde_json::Value =
            serde_json::from_str(&format_request(&request, LogFormat::Json)).unwrap();
        assert_eq!(json["method"], "Get");
        assert_eq!(json["name"], "/api");
        assert_eq!(json["user"], 3);

        assert_eq!(
            format_request(&request, LogFormat::Csv),
            "1203,GET,/api,http://127.0.0.1/api,http://127.0.0.1/api,false,2,0,true,3,"
        );
        // The csv header and rows have the same number of columns.
        assert_eq!(
            CSV_HEADER.split(',').count(),
            format_csv_row(&request).split(',').count()
        );

        request.success = false;
        request.error = "error sending request, \"connection refused\"".to_string();
        assert!(format_csv_row(&request)
            .ends_with(",false,3,\"error sending request, \"\"connection refused\"\"\""));

        assert!(format_request(&request, LogFormat::Raw).starts_with("RequestMetric {"));
        assert!(format_request(&request, LogFormat::Pretty).contains("\n    name: \"/api\","));
    }

    #[tokio::test]
    async fn logger_writes_and_flushes() {
        const LOG: &str = "logger-unit-test.log";
        let file = File::create(LOG).await.unwrap();
        let (tx, rx) = flume::unbounded();
        let handle = tokio::spawn(logger_main(LOG.to_string(), file, LogFormat::Csv, rx));
        tx.send(Some(request())).unwrap();
        tx.send(Some(request())).unwrap();
        tx.send(None).unwrap();
        handle.await.unwrap().unwrap();

        let contents = std::fs::read_to_string(LOG).unwrap();
        std::fs::remove_file(LOG).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
    }
}
