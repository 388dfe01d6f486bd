//! minimap2-backed aligners.
//!
//! `mappy` maps on the calling thread; `mappy_rs` keeps a pool of worker
//! threads, each with its own loaded index, fed through bounded channels.
//! Both validate the reference path and extension up front and treat a
//! per-read mapping failure as "unmapped", never as a pipeline error.

use std::path::{Path, PathBuf};

use crossbeam::channel::{self, Receiver, Sender};
use minimap2::Aligner as MmAligner;

use crate::config::PluginSettings;
use crate::error::{Error, Result};
use crate::model::{Alignment, Alignments, ReadResult, Strand};
use crate::plugins::{Aligner, ResultStream};

/// Reference file extensions accepted for `fn_idx_in`.
const INDEX_EXTENSIONS: [&str; 14] = [
    ".mmi", ".fasta", ".fna", ".fsa", ".fa", ".fastq", ".fq", ".fasta.gz", ".fna.gz", ".fsa.gz",
    ".fa.gz", ".fastq.gz", ".fq.gz", ".mmi.gz",
];

fn index_path(settings: &PluginSettings, plugin: &str) -> Result<PathBuf> {
    settings
        .str_param("fn_idx_in")
        .map(PathBuf::from)
        .ok_or_else(|| {
            Error::plugin_init(
                plugin,
                "missing required parameter 'fn_idx_in' (reference index path)",
            )
        })
}

fn validate_index_path(path: &Path, plugin: &str) -> Result<()> {
    if !path.is_file() {
        return Err(Error::plugin_init(
            plugin,
            format!("reference index path does not exist: {}", path.display()),
        ));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if !INDEX_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        return Err(Error::plugin_init(
            plugin,
            format!(
                "reference {} has an unexpected extension; expected one of {}",
                path.display(),
                INDEX_EXTENSIONS.join(", ")
            ),
        ));
    }
    Ok(())
}

fn load_index(path: &Path, plugin: &str) -> Result<MmAligner> {
    let path_str = path.to_string_lossy();
    MmAligner::builder()
        .map_ont()
        .with_index(path_str.as_ref(), None)
        .map_err(|e| {
            Error::plugin_init(
                plugin,
                format!("failed to load reference index {}: {e}", path.display()),
            )
        })
}

/// Map one sequence, converting mappings into our alignment records. A
/// mapping failure logs and returns no alignments.
fn map_seq(aligner: &MmAligner, seq: &str, read_id: &str) -> Alignments {
    match aligner.map(seq.as_bytes(), false, false, None, None) {
        Ok(mappings) => mappings
            .iter()
            .map(|m| Alignment {
                contig: m
                    .target_name
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                strand: if matches!(m.strand, minimap2::Strand::Reverse) {
                    Strand::Reverse
                } else {
                    Strand::Forward
                },
                r_st: m.target_start.max(0) as u64,
                r_en: m.target_end.max(0) as u64,
                mapq: m.mapq as u32,
            })
            .collect(),
        Err(e) => {
            tracing::warn!(read_id, error = %e, "minimap2 mapping failed; treating read as unmapped");
            Alignments::new()
        }
    }
}

// ---------------------------------------------------------------------------
// MappyAligner (single-threaded)
// ---------------------------------------------------------------------------

pub struct MappyAligner {
    path: PathBuf,
    aligner: Option<MmAligner>,
}

impl MappyAligner {
    pub fn from_settings(settings: &PluginSettings) -> Result<MappyAligner> {
        let path = index_path(settings, "mappy")?;
        validate_index_path(&path, "mappy")?;
        let aligner = load_index(&path, "mappy")?;
        Ok(MappyAligner {
            path,
            aligner: Some(aligner),
        })
    }
}

impl Aligner for MappyAligner {
    fn align<'a>(&'a mut self, results: ResultStream<'a>) -> ResultStream<'a> {
        let aligner = self.aligner.as_ref();
        Box::new(results.map(move |mut r| {
            r.alignment_data = match aligner {
                Some(al) if !r.seq.is_empty() => map_seq(al, &r.seq, &r.read_id),
                _ => Alignments::new(),
            };
            r
        }))
    }

    fn validate(&self) -> Result<()> {
        validate_index_path(&self.path, "mappy")
    }

    fn initialised(&self) -> bool {
        self.aligner.is_some()
    }

    fn describe(&self) -> String {
        format!(
            "minimap2 aligner (single-threaded), reference: {}",
            self.path.display()
        )
    }

    fn disconnect(&mut self) {
        self.aligner = None;
    }
}

// ---------------------------------------------------------------------------
// ThreadedMappyAligner (worker pool)
// ---------------------------------------------------------------------------

pub struct ThreadedMappyAligner {
    path: PathBuf,
    threads: usize,
    jobs: Option<Sender<ReadResult>>,
    done: Receiver<ReadResult>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadedMappyAligner {
    pub fn from_settings(settings: &PluginSettings) -> Result<ThreadedMappyAligner> {
        let path = index_path(settings, "mappy_rs")?;
        validate_index_path(&path, "mappy_rs")?;
        let threads = settings.int_param("n_threads").unwrap_or(1).max(1) as usize;

        let (job_tx, job_rx) = channel::bounded::<ReadResult>(threads * 2);
        let (done_tx, done_rx) = channel::unbounded::<ReadResult>();
        let (init_tx, init_rx) = channel::bounded::<Result<()>>(threads);

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let path = path.clone();
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let init = init_tx.clone();
            workers.push(std::thread::spawn(move || {
                // Each worker owns its index; loading happens once per
                // worker, up front, and failure is reported to the
                // constructor.
                let aligner = match load_index(&path, "mappy_rs") {
                    Ok(al) => {
                        init.send(Ok(())).ok();
                        al
                    }
                    Err(e) => {
                        init.send(Err(e)).ok();
                        return;
                    }
                };
                drop(init);
                while let Ok(mut result) = jobs.recv() {
                    if !result.seq.is_empty() {
                        result.alignment_data = map_seq(&aligner, &result.seq, &result.read_id);
                    }
                    if done.send(result).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(init_tx);
        drop(done_tx);

        for _ in 0..threads {
            match init_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::plugin_init(
                        "mappy_rs",
                        "worker thread died during index load",
                    ))
                }
            }
        }

        Ok(ThreadedMappyAligner {
            path,
            threads,
            jobs: Some(job_tx),
            done: done_rx,
            workers,
        })
    }

    fn shutdown(&mut self) {
        self.jobs = None;
        for handle in self.workers.drain(..) {
            handle.join().ok();
        }
    }
}

impl Aligner for ThreadedMappyAligner {
    fn align<'a>(&'a mut self, results: ResultStream<'a>) -> ResultStream<'a> {
        let Some(jobs) = &self.jobs else {
            // Disconnected; nothing can be mapped any more.
            return Box::new(std::iter::empty());
        };
        let mut submitted = 0usize;
        for result in results {
            if jobs.send(result).is_err() {
                tracing::error!("mappy_rs worker pool is gone; dropping remainder of batch");
                break;
            }
            submitted += 1;
        }
        let done = &self.done;
        Box::new((0..submitted).map_while(move |_| done.recv().ok()))
    }

    fn validate(&self) -> Result<()> {
        validate_index_path(&self.path, "mappy_rs")
    }

    fn initialised(&self) -> bool {
        self.jobs.is_some()
    }

    fn describe(&self) -> String {
        format!(
            "minimap2 aligner ({} worker threads), reference: {}",
            self.threads,
            self.path.display()
        )
    }

    fn disconnect(&mut self) {
        self.shutdown();
    }
}

impl Drop for ThreadedMappyAligner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_index_parameter() {
        let settings = PluginSettings {
            name: "mappy".into(),
            parameters: toml::Table::new(),
        };
        let err = index_path(&settings, "mappy").unwrap_err();
        assert!(err.to_string().contains("fn_idx_in"));
    }

    #[test]
    fn test_missing_reference_file() {
        let err = validate_index_path(Path::new("/nope/ref.mmi"), "mappy").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_wrong_extension_rejected() {
        let f = tempfile::Builder::new().suffix(".sam").tempfile().unwrap();
        let err = validate_index_path(f.path(), "mappy").unwrap_err();
        assert!(err.to_string().contains("unexpected extension"));
    }

    #[test]
    fn test_accepted_extensions() {
        for suffix in [".mmi", ".fa", ".fasta.gz", ".fq"] {
            let f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
            assert!(
                validate_index_path(f.path(), "mappy").is_ok(),
                "suffix {suffix} should be accepted"
            );
        }
    }
}
