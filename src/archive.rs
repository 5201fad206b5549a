use anyhow::{Context, Result, anyhow, bail};
use chrono::{Datelike, NaiveDateTime, Timelike};
use rusqlite::{Connection, params};
use std::fmt;
use std::io::{Seek, Write};
use std::path::Path;
use zip::ZipWriter;
use zip::write::FileOptions;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parses a GitHub `created_at` style timestamp.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .with_context(|| format!("bad timestamp {s:?}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Zip,
    Sqlite,
}

impl Format {
    /// Picks the format implied by the file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("zip") => Ok(Format::Zip),
            Some("sqlite" | "sqlite3" | "db") => Ok(Format::Sqlite),
            _ => bail!(
                "cannot tell the archive format of {}; use a .zip or .sqlite3 name, or pass --format",
                path.display()
            ),
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Format::Zip => ".zip",
            Format::Sqlite => ".sqlite3",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Zip => "zip",
            Format::Sqlite => "sqlite",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Issue,
    Comment,
}

impl Subject {
    fn as_str(self) -> &'static str {
        match self {
            Subject::Issue => "issue",
            Subject::Comment => "comment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Issue,
    Comment,
    Label,
    Reaction { subject: Subject, subject_id: u64 },
}

/// One archived GitHub object.
#[derive(Debug, Clone)]
pub struct Record {
    pub kind: Kind,
    pub id: u64,
    pub created_at: Option<NaiveDateTime>,
    pub body: Vec<u8>,
}

impl Record {
    pub fn zip_path(&self) -> String {
        let id = self.id;
        match self.kind {
            Kind::Issue => format!("issues/{id}.json"),
            Kind::Comment => format!("issues/comments/{id}.json"),
            Kind::Label => format!("labels/{id}.json"),
            Kind::Reaction {
                subject: Subject::Issue,
                subject_id,
            } => format!("issues/{subject_id}/reactions/{id}.json"),
            Kind::Reaction {
                subject: Subject::Comment,
                subject_id,
            } => format!("issues/comments/{subject_id}/reactions/{id}.json"),
        }
    }

    fn json(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).with_context(|| format!("{} is not UTF-8", self.zip_path()))
    }
}

pub struct Readme {
    pub html_url: String,
    pub made: NaiveDateTime,
}

impl Readme {
    pub fn text(&self) -> String {
        format!(
            "Archive of the GitHub repository {}\nmade {}.\n",
            self.html_url,
            self.made.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

pub trait Archive {
    fn add_readme(&mut self, readme: &Readme) -> Result<()>;
    fn add(&mut self, record: &Record) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Converts to the zip DOS timestamp; `None` maps to the zip epoch.
pub fn zip_time(t: Option<NaiveDateTime>) -> Result<zip::DateTime> {
    let Some(t) = t else {
        return Ok(zip::DateTime::default());
    };
    let year = u16::try_from(t.year())
        .with_context(|| format!("{t} is out of range for a zip archive"))?;
    zip::DateTime::from_date_and_time(
        year,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    )
    .map_err(|()| anyhow!("{t} is out of range for a zip archive"))
}

pub struct ZipArchive<W: Write + Seek> {
    writer: ZipWriter<W>,
}

impl<W: Write + Seek> ZipArchive<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: ZipWriter::new(inner),
        }
    }

    fn write_entry(&mut self, path: &str, modified: zip::DateTime, contents: &[u8]) -> Result<()> {
        let options = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(modified);
        self.writer
            .start_file(path, options)
            .with_context(|| format!("failed to add {path} to archive"))?;
        self.writer.write_all(contents)?;
        Ok(())
    }
}

impl<W: Write + Seek> Archive for ZipArchive<W> {
    fn add_readme(&mut self, readme: &Readme) -> Result<()> {
        self.write_entry("README", zip_time(Some(readme.made))?, readme.text().as_bytes())
    }

    fn add(&mut self, record: &Record) -> Result<()> {
        self.write_entry(&record.zip_path(), zip_time(record.created_at)?, &record.body)
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let mut inner = self.writer.finish().context("failed to finish zip archive")?;
        inner.flush()?;
        Ok(())
    }
}

const SCHEMA: &str = "
CREATE TABLE archive_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE issues (
    id INTEGER PRIMARY KEY,
    number INTEGER,
    created_at TEXT,
    json TEXT NOT NULL
);
CREATE TABLE comments (
    id INTEGER PRIMARY KEY,
    issue_url TEXT,
    created_at TEXT,
    json TEXT NOT NULL
);
CREATE TABLE reactions (
    id INTEGER PRIMARY KEY,
    subject TEXT NOT NULL,
    subject_id INTEGER NOT NULL,
    content TEXT,
    created_at TEXT,
    json TEXT NOT NULL
);
CREATE INDEX idx_reactions_subject ON reactions(subject, subject_id);
CREATE TABLE labels (
    id INTEGER PRIMARY KEY,
    name TEXT,
    json TEXT NOT NULL
);
";

pub struct SqliteArchive {
    conn: Connection,
}

impl SqliteArchive {
    /// Creates the schema in a fresh database and opens a transaction that
    /// `finish` commits.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("failed to create archive schema")?;
        conn.execute_batch("BEGIN")?;
        Ok(Self { conn })
    }

    fn info(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO archive_info (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

fn sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).with_context(|| format!("id {id} does not fit in SQLite"))
}

impl Archive for SqliteArchive {
    fn add_readme(&mut self, readme: &Readme) -> Result<()> {
        self.info("readme", &readme.text())?;
        self.info("repository", &readme.html_url)?;
        self.info("created_at", &readme.made.format(TIMESTAMP_FORMAT).to_string())
    }

    fn add(&mut self, record: &Record) -> Result<()> {
        let json = record.json()?;
        let value: serde_json::Value = serde_json::from_str(json)
            .with_context(|| format!("{} is not JSON", record.zip_path()))?;
        let id = sql_id(record.id)?;
        let created_at = record.created_at.map(|t| t.format(TIMESTAMP_FORMAT).to_string());

        match record.kind {
            Kind::Issue => {
                let number = value.get("number").and_then(serde_json::Value::as_i64);
                self.conn.execute(
                    "INSERT OR REPLACE INTO issues (id, number, created_at, json) VALUES (?1, ?2, ?3, ?4)",
                    params![id, number, created_at, json],
                )?;
            }
            Kind::Comment => {
                let issue_url = value.get("issue_url").and_then(serde_json::Value::as_str);
                self.conn.execute(
                    "INSERT OR REPLACE INTO comments (id, issue_url, created_at, json) VALUES (?1, ?2, ?3, ?4)",
                    params![id, issue_url, created_at, json],
                )?;
            }
            Kind::Label => {
                let name = value.get("name").and_then(serde_json::Value::as_str);
                self.conn.execute(
                    "INSERT OR REPLACE INTO labels (id, name, json) VALUES (?1, ?2, ?3)",
                    params![id, name, json],
                )?;
            }
            Kind::Reaction { subject, subject_id } => {
                let content = value.get("content").and_then(serde_json::Value::as_str);
                self.conn.execute(
                    "INSERT OR REPLACE INTO reactions (id, subject, subject_id, content, created_at, json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, subject.as_str(), sql_id(subject_id)?, content, created_at, json],
                )?;
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT").context("failed to commit archive")?;
        self.conn.close().map_err(|(_, e)| e).context("failed to close archive")?;
        Ok(())
    }
}

/// Builds an archive at `path` through `fill`.
///
/// The archive is written to a temporary file next to `path` and only moved
/// into place once finished. On error the temporary file is removed and
/// `path` is left as it was.
pub fn create<T>(
    path: &Path,
    format: Format,
    fill: impl FnOnce(&mut dyn Archive) -> Result<T>,
) -> Result<T> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let temp = tempfile::Builder::new()
        .prefix(".bbs-backup-")
        .suffix(format.suffix())
        .tempfile_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;

    let mut archive: Box<dyn Archive> = match format {
        Format::Zip => Box::new(ZipArchive::new(temp.reopen()?)),
        Format::Sqlite => Box::new(SqliteArchive::create(temp.path())?),
    };
    let value = fill(archive.as_mut())?;
    archive.finish()?;

    temp.persist(path)
        .with_context(|| format!("failed to move archive to {}", path.display()))?;
    Ok(value)
}
