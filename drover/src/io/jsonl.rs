// JSONL File Format
// Newline-delimited JSON records, one split per file, part files per writer

use crate::config::{ConfStep, JobConf};
use crate::error::{DroverError, DroverResult};
use crate::io::dseq::DSeq;
use crate::io::dsink::DSink;
use crate::io::format::{
    InputFormat, OutputFormat, Record, RecordReader, RecordWriter, Split, INPUT_FORMAT_KEY,
    OUTPUT_BASENAME_KEY, OUTPUT_FORMAT_KEY,
};

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

/// Key listing the files or directories a jsonl input reads
pub const INPUT_PATHS_KEY: &str = "drover.jsonl.input.paths";
/// Key naming the directory a jsonl output writes part files under
pub const OUTPUT_DIR_KEY: &str = "drover.jsonl.output.dir";

const DEFAULT_BASENAME: &str = "part-00000";

/// DSeq reading jsonl records from the given files or directories
pub fn dseq(paths: impl IntoIterator<Item = impl Into<String>>) -> DSeq {
    let paths: Vec<Value> = paths.into_iter().map(|p| Value::from(p.into())).collect();
    DSeq::new(ConfStep::params([
        (INPUT_FORMAT_KEY, Value::from("jsonl")),
        (INPUT_PATHS_KEY, Value::from(paths)),
    ]))
}

/// DSink writing jsonl part files under the given directory
pub fn dsink(dir: impl AsRef<Path>) -> DSink {
    let dir = dir.as_ref().to_string_lossy().into_owned();
    let step = ConfStep::params([
        (OUTPUT_FORMAT_KEY, Value::from("jsonl")),
        (OUTPUT_DIR_KEY, Value::from(dir.clone())),
    ]);
    DSink::new(step, dseq([dir]))
}

/// Expand a path into its jsonl files: a file stands for itself, a
/// directory for its `*.jsonl` children in sorted order, and a path that
/// does not exist yet (an unwritten sink's mirror) for no files at all
fn expand(path: &Path) -> DroverResult<Vec<PathBuf>> {
    if path.is_dir() {
        let mut files: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();
        Ok(files)
    } else if path.is_file() {
        Ok(vec![path.to_path_buf()])
    } else {
        Ok(Vec::new())
    }
}

/// Input side of the jsonl format
pub struct JsonlInput;

struct JsonlReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl RecordReader for JsonlReader {
    fn next_record(&mut self) -> Option<DroverResult<Record>> {
        for line in self.lines.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<Value>(&line)
                .map_err(DroverError::from)
                .and_then(|value| {
                    match (value.get("k"), value.get("v")) {
                        (Some(k), Some(v)) => Ok((k.clone(), v.clone())),
                        _ => Err(DroverError::resource("jsonl record missing 'k' or 'v'")),
                    }
                });
            return Some(parsed);
        }
        None
    }
}

impl InputFormat for JsonlInput {
    fn list_splits(&self, conf: &JobConf) -> DroverResult<Vec<Split>> {
        let paths: Vec<String> = conf.get(INPUT_PATHS_KEY)?;
        let mut splits = Vec::new();
        for path in paths {
            for file in expand(Path::new(&path))? {
                splits.push(Split::new(json!({ "path": file.to_string_lossy() })));
            }
        }
        Ok(splits)
    }

    fn open_reader(&self, split: &Split, _conf: &JobConf) -> DroverResult<Box<dyn RecordReader>> {
        let path = split
            .data
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| DroverError::resource("malformed jsonl split"))?;
        let file = File::open(path)?;
        Ok(Box::new(JsonlReader {
            lines: BufReader::new(file).lines(),
        }))
    }
}

/// Output side of the jsonl format
pub struct JsonlOutput;

struct JsonlWriter {
    writer: BufWriter<File>,
}

impl RecordWriter for JsonlWriter {
    fn write(&mut self, key: &Value, value: &Value) -> DroverResult<()> {
        let line = serde_json::to_string(&json!({ "k": key, "v": value }))?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> DroverResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl OutputFormat for JsonlOutput {
    fn record_writer(&self, conf: &JobConf) -> DroverResult<Box<dyn RecordWriter>> {
        let dir: String = conf.get(OUTPUT_DIR_KEY)?;
        let basename: String = conf
            .get_opt(OUTPUT_BASENAME_KEY)?
            .unwrap_or_else(|| DEFAULT_BASENAME.to_string());
        fs::create_dir_all(&dir)?;
        let path = Path::new(&dir).join(format!("{basename}.jsonl"));
        let file = File::create(path)?;
        Ok(Box::new(JsonlWriter {
            writer: BufWriter::new(file),
        }))
    }

    fn output_paths(&self, conf: &JobConf) -> DroverResult<Vec<PathBuf>> {
        let dir: String = conf.get(OUTPUT_DIR_KEY)?;
        Ok(vec![PathBuf::from(dir)])
    }
}
