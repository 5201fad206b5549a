use crate::archive::{Archive, Kind, Readme, Record, Subject, parse_timestamp};
use crate::github::{
    self, Fetch, MEDIA_TYPE, MEDIA_TYPE_REACTIONS, RepoRef, check_same_origin, paginate,
};
use anyhow::{Context, Result, bail};
use chrono::{NaiveDateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone)]
pub struct Options {
    /// Also archive the reactions on every issue and comment.
    pub reactions: bool,
    /// Concurrent detail requests per listing page.
    pub jobs: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { reactions: true, jobs: 1 }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub issues: usize,
    pub comments: usize,
    pub reactions: usize,
    pub labels: usize,
}

impl Summary {
    fn count(&mut self, record: &Record) {
        match record.kind {
            Kind::Issue => self.issues += 1,
            Kind::Comment => self.comments += 1,
            Kind::Label => self.labels += 1,
            Kind::Reaction { .. } => self.reactions += 1,
        }
    }
}

/// The three listings that make up a backup.
#[derive(Debug, Clone, Copy)]
enum Section {
    Issues,
    Comments,
    Labels,
}

impl Section {
    fn kind(self) -> Kind {
        match self {
            Section::Issues => Kind::Issue,
            Section::Comments => Kind::Comment,
            Section::Labels => Kind::Label,
        }
    }

    fn media_type(self) -> &'static str {
        match self {
            Section::Issues | Section::Comments => MEDIA_TYPE_REACTIONS,
            Section::Labels => MEDIA_TYPE,
        }
    }

    fn reaction_subject(self) -> Option<Subject> {
        match self {
            Section::Issues => Some(Subject::Issue),
            Section::Comments => Some(Subject::Comment),
            Section::Labels => None,
        }
    }

    fn listing_url(self, api: &Url, repo: &RepoRef) -> Result<Url> {
        match self {
            Section::Issues => {
                let mut url = github::repo_url(api, repo, &["issues"])?;
                url.query_pairs_mut()
                    .append_pair("sort", "created")
                    .append_pair("direction", "asc")
                    .append_pair("state", "all");
                Ok(url)
            }
            // Comments point at their parent through `issue_url`.
            Section::Comments => github::repo_url(api, repo, &["issues", "comments"]),
            Section::Labels => github::repo_url(api, repo, &["labels"]),
        }
    }
}

#[derive(Deserialize)]
struct Listed {
    id: u64,
    url: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    reactions: Option<ReactionRollup>,
}

#[derive(Deserialize)]
struct ReactionRollup {
    url: String,
}

#[derive(Deserialize)]
struct ListedReaction {
    id: u64,
    #[serde(default)]
    created_at: Option<String>,
}

fn timestamp(s: Option<&str>) -> Result<Option<NaiveDateTime>> {
    s.map(parse_timestamp).transpose()
}

fn api_link(api: &Url, link: &str) -> Result<Url> {
    let url = Url::parse(link).with_context(|| format!("bad API URL {link:?}"))?;
    check_same_origin(api, &url)?;
    Ok(url)
}

/// Fetches one listed object in full, plus its reactions.
fn fetch_item<F: Fetch + ?Sized>(
    fetch: &F,
    api: &Url,
    section: Section,
    entry: &Value,
    options: &Options,
) -> Result<Vec<Record>> {
    let item = Listed::deserialize(entry).context("unexpected entry in listing")?;
    let url = api_link(api, &item.url)?;
    let body = fetch.get(&url, section.media_type())?.body;
    let mut records = vec![Record {
        kind: section.kind(),
        id: item.id,
        created_at: timestamp(item.created_at.as_deref())?,
        body,
    }];

    // There is no repository-wide reactions listing, so go per object.
    let (Some(subject), Some(rollup)) = (section.reaction_subject(), &item.reactions) else {
        return Ok(records);
    };
    if !options.reactions {
        return Ok(records);
    }
    let reactions_url = api_link(api, &rollup.url)?;
    for page in paginate(fetch, &reactions_url, MEDIA_TYPE_REACTIONS) {
        for reaction in page? {
            let listed =
                ListedReaction::deserialize(&reaction).context("unexpected reaction entry")?;
            records.push(Record {
                kind: Kind::Reaction {
                    subject,
                    subject_id: item.id,
                },
                id: listed.id,
                created_at: timestamp(listed.created_at.as_deref())?,
                body: serde_json::to_vec(&reaction)?,
            });
        }
    }
    Ok(records)
}

/// Fetches the details of one listing page on `options.jobs` workers and
/// returns the records in listing order.
fn fetch_page<F: Fetch + ?Sized>(
    fetch: &F,
    api: &Url,
    section: Section,
    entries: &[Value],
    options: &Options,
) -> Result<Vec<Record>> {
    let total = entries.len();
    let next_idx = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<Result<Vec<Record>>>>> =
        Mutex::new((0..total).map(|_| None).collect());
    let workers = options.jobs.clamp(1, total.max(1));

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                loop {
                    let idx = next_idx.fetch_add(1, Ordering::SeqCst);
                    if idx >= total {
                        break;
                    }
                    let result = fetch_item(fetch, api, section, &entries[idx], options);
                    let failed = result.is_err();
                    results.lock().unwrap_or_else(PoisonError::into_inner)[idx] = Some(result);
                    if failed {
                        // Stop handing out work; earlier indices are already claimed.
                        next_idx.store(total, Ordering::SeqCst);
                    }
                }
            });
        }
    });

    let mut records = Vec::new();
    for (idx, result) in results
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .enumerate()
    {
        match result {
            Some(result) => records.extend(result?),
            None => bail!("entry {idx} of {section:?} listing was never fetched"),
        }
    }
    Ok(records)
}

fn backup_section<F: Fetch + ?Sized>(
    fetch: &F,
    api: &Url,
    repo: &RepoRef,
    section: Section,
    archive: &mut dyn Archive,
    options: &Options,
    summary: &mut Summary,
) -> Result<()> {
    let url = section.listing_url(api, repo)?;
    log::info!("Backing up {section:?} of {repo}");
    for page in paginate(fetch, &url, section.media_type()) {
        let entries = page?;
        for record in fetch_page(fetch, api, section, &entries, options)? {
            archive.add(&record)?;
            summary.count(&record);
        }
        log::debug!("{section:?}: {summary:?}");
    }
    Ok(())
}

/// Copies the issues, comments, reactions and labels of `repo` into `archive`.
pub fn run_backup<F: Fetch + ?Sized>(
    fetch: &F,
    api: &Url,
    repo: &RepoRef,
    archive: &mut dyn Archive,
    options: &Options,
) -> Result<Summary> {
    let readme = Readme {
        html_url: github::html_url(api, repo)?.to_string(),
        made: Utc::now().naive_utc(),
    };
    archive.add_readme(&readme)?;

    let mut summary = Summary::default();
    for section in [Section::Issues, Section::Comments, Section::Labels] {
        backup_section(fetch, api, repo, section, archive, options, &mut summary)?;
    }
    Ok(summary)
}
