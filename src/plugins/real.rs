//! Basecaller client — framed JSON over a Unix domain socket.
//!
//! The basecaller runs as a long-lived external server; each batch is one
//! request/response exchange. The wire format is owned here: a
//! [`CallRequest`] frame out, one [`CallResponse`] frame back, with the
//! per-read `error` field distinguishing "this read failed to basecall"
//! (empty sequence, pipeline continues) from a dead socket (error, driver
//! degrades).

use std::io::{BufReader, BufWriter};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PluginSettings;
use crate::error::{Error, Result};
use crate::instrument::wire::{read_frame, write_frame};
use crate::model::{Chunk, ReadResult};
use crate::plugins::{Caller, ResultStream};

const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 10.0;

#[derive(Debug, Serialize)]
struct CallRequest<'a> {
    reads: &'a [Chunk],
}

#[derive(Debug, Deserialize)]
struct CalledRead {
    channel: u32,
    read_number: u32,
    read_id: String,
    #[serde(default)]
    seq: String,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    barcode: Option<String>,
    #[serde(default)]
    basecall_data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    reads: Vec<CalledRead>,
}

#[derive(Debug)]
pub struct SocketCaller {
    socket_path: PathBuf,
    connect_timeout: Duration,
    stream: Option<(BufReader<UnixStream>, BufWriter<UnixStream>)>,
}

impl SocketCaller {
    pub fn from_settings(settings: &PluginSettings) -> Result<SocketCaller> {
        let socket_path = settings
            .str_param("address")
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::plugin_init("real", "missing required parameter 'address' (basecaller socket path)")
            })?;
        let connect_timeout = settings
            .parameters
            .get("connect_timeout")
            .and_then(|v| v.as_float())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        Ok(SocketCaller {
            socket_path,
            connect_timeout: Duration::from_secs_f64(connect_timeout),
            stream: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            let hint = if e.kind() == std::io::ErrorKind::PermissionDenied {
                "; check the socket's ownership and mode"
            } else {
                ""
            };
            Error::plugin_init(
                "real",
                format!(
                    "cannot connect to basecaller socket {}: {e}{hint}",
                    self.socket_path.display()
                ),
            )
        })?;
        stream
            .set_read_timeout(Some(self.connect_timeout))
            .map_err(Error::Io)?;
        let write_half = stream.try_clone().map_err(Error::Io)?;
        self.stream = Some((BufReader::new(stream), BufWriter::new(write_half)));
        Ok(())
    }

    fn exchange(&mut self, chunks: &[Chunk]) -> Result<Vec<CalledRead>> {
        if self.stream.is_none() {
            self.connect()?;
        }
        let (reader, writer) = self.stream.as_mut().expect("connected");
        let send = write_frame(writer, &CallRequest { reads: chunks });
        let response: std::io::Result<Option<CallResponse>> = match send {
            Ok(()) => read_frame(reader),
            Err(e) => Err(e),
        };
        match response {
            Ok(Some(resp)) => Ok(resp.reads),
            Ok(None) => {
                self.stream = None;
                Err(Error::TransportLost("basecaller closed its socket".into()))
            }
            Err(e) => {
                self.stream = None;
                Err(Error::TransportLost(format!("basecaller exchange failed: {e}")))
            }
        }
    }
}

impl Caller for SocketCaller {
    fn basecall<'a>(&'a mut self, chunks: &'a [Chunk]) -> Result<ResultStream<'a>> {
        let called = self.exchange(chunks)?;
        Ok(Box::new(called.into_iter().map(|c| {
            if let Some(err) = &c.error {
                tracing::warn!(
                    read_id = %c.read_id,
                    channel = c.channel,
                    error = %err,
                    "basecall failed for read; treating as no sequence"
                );
            }
            ReadResult {
                channel: c.channel,
                read_number: c.read_number,
                read_id: c.read_id,
                barcode: c.barcode,
                seq: if c.error.is_some() { String::new() } else { c.seq },
                quality: c.quality,
                basecall_data: c.basecall_data,
                alignment_data: Default::default(),
                decision: crate::model::Decision::NoSeq,
            }
        })))
    }

    fn validate(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.socket_path).map_err(|e| {
            Error::plugin_init(
                "real",
                format!(
                    "basecaller socket {} is not accessible: {e}",
                    self.socket_path.display()
                ),
            )
        })?;
        if !meta.file_type().is_socket() {
            return Err(Error::plugin_init(
                "real",
                format!("{} exists but is not a socket", self.socket_path.display()),
            ));
        }
        // Prove connectability (and permissions) up front rather than on the
        // first batch.
        UnixStream::connect(&self.socket_path)
            .map(drop)
            .map_err(|e| {
                Error::plugin_init(
                    "real",
                    format!(
                        "cannot connect to basecaller socket {}: {e}",
                        self.socket_path.display()
                    ),
                )
            })
    }

    fn describe(&self) -> String {
        format!("basecaller server at {}", self.socket_path.display())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        self.connect()
    }

    fn disconnect(&mut self) {
        if let Some((reader, _)) = self.stream.take() {
            reader.get_ref().shutdown(std::net::Shutdown::Both).ok();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn settings(path: &std::path::Path) -> PluginSettings {
        let mut parameters = toml::Table::new();
        parameters.insert(
            "address".into(),
            toml::Value::String(path.display().to_string()),
        );
        PluginSettings {
            name: "real".into(),
            parameters,
        }
    }

    fn chunk(channel: u32, read_number: u32) -> Chunk {
        Chunk {
            channel,
            read_number,
            read_id: format!("r-{channel}-{read_number}"),
            raw_signal: vec![0; 4],
            chunk_start_sample: 0,
            chunk_length: 4,
            median_before: 0.0,
            median: 0.0,
            classifications: Vec::new(),
        }
    }

    /// A scripted basecaller server answering one request.
    fn serve_once(listener: UnixListener) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let req: serde_json::Value = read_frame(&mut reader).unwrap().unwrap();
            let reads: Vec<serde_json::Value> = req["reads"]
                .as_array()
                .unwrap()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "channel": r["channel"],
                        "read_number": r["read_number"],
                        "read_id": r["read_id"],
                        "seq": "ACGTACGT",
                        "barcode": "barcode01",
                    })
                })
                .collect();
            let mut writer = BufWriter::new(stream);
            write_frame(&mut writer, &serde_json::json!({ "reads": reads })).unwrap();
        })
    }

    #[test]
    fn test_missing_address_is_init_error() {
        let empty = PluginSettings {
            name: "real".into(),
            parameters: toml::Table::new(),
        };
        let err = SocketCaller::from_settings(&empty).unwrap_err();
        assert!(err.to_string().contains("address"));
    }

    #[test]
    fn test_validate_missing_socket() {
        let caller =
            SocketCaller::from_settings(&settings(std::path::Path::new("/no/such/socket"))).unwrap();
        let err = caller.validate().unwrap_err();
        assert!(err.to_string().contains("not accessible"));
    }

    #[test]
    fn test_basecall_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("caller.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = serve_once(listener);

        let mut caller = SocketCaller::from_settings(&settings(&sock)).unwrap();
        let chunks = vec![chunk(1, 1), chunk(2, 7)];
        let results: Vec<ReadResult> = caller.basecall(&chunks).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].seq, "ACGTACGT");
        assert_eq!(results[1].read_number, 7);
        assert_eq!(results[0].barcode.as_deref(), Some("barcode01"));
        caller.disconnect();
        server.join().unwrap();
    }

    #[test]
    fn test_dead_server_is_transport_lost() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("caller.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        // Accept then immediately drop the connection.
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let mut caller = SocketCaller::from_settings(&settings(&sock)).unwrap();
        let chunks = vec![chunk(1, 1)];
        let err = caller.basecall(&chunks).err().expect("transport error");
        assert!(matches!(err, Error::TransportLost(_)));
        server.join().unwrap();
    }
}
