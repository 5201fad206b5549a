use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, HeaderMap, LINK};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.github.com/";

// https://docs.github.com/en/rest/overview/media-types
pub const MEDIA_TYPE: &str = "application/vnd.github.v3+json";
/// Includes the `reactions` rollup on issues and comments.
pub const MEDIA_TYPE_REACTIONS: &str = "application/vnd.github.squirrel-girl-preview+json";

const PER_PAGE: &str = "100";

/// A `username:token` pair sent as HTTP basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl FromStr for Credentials {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((username, token)) = s.split_once(':') else {
            bail!("credentials must look like username:token");
        };
        if username.is_empty() {
            bail!("credentials are missing the username part");
        }
        Ok(Self {
            username: username.to_string(),
            token: token.to_string(),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// An `owner/repo` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepoRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => bail!("repository must look like owner/repo, got {s:?}"),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// API URL under `/repos/{owner}/{repo}/`. Owner and repo are escaped as
/// single path segments.
pub fn repo_url(api: &Url, repo: &RepoRef, tail: &[&str]) -> Result<Url> {
    let mut url = api.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| anyhow!("{api} cannot be used as an API base URL"))?
        .pop_if_empty()
        .push("repos")
        .push(&repo.owner)
        .push(&repo.name)
        .extend(tail);
    Ok(url)
}

/// Browser URL of the repository, with a trailing slash.
pub fn html_url(api: &Url, repo: &RepoRef) -> Result<Url> {
    let mut url = api.clone();
    url.set_query(None);
    url.set_fragment(None);
    if url.host_str() == Some("api.github.com") {
        url.set_host(Some("github.com"))?;
    }
    url.path_segments_mut()
        .map_err(|()| anyhow!("{api} cannot be used as an API base URL"))?
        .clear()
        .push(&repo.owner)
        .push(&repo.name)
        .push("");
    Ok(url)
}

pub fn check_same_origin(base: &Url, url: &Url) -> Result<()> {
    if base.origin() != url.origin() {
        bail!("{url} does not have the same origin as {base}");
    }
    Ok(())
}

/// Returns the target of the `rel="next"` entry of a `Link` header value.
pub fn parse_next_link(value: &str) -> Option<&str> {
    value.split(',').find_map(|link| {
        let (target, params) = link.trim().split_once(';')?;
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        let is_next = params.split(';').any(|param| {
            let Some((key, rel)) = param.trim().split_once('=') else {
                return false;
            };
            key.trim().eq_ignore_ascii_case("rel")
                && rel
                    .trim()
                    .trim_matches('"')
                    .split_ascii_whitespace()
                    .any(|r| r.eq_ignore_ascii_case("next"))
        });
        is_next.then_some(target)
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// When the response is rate limited, the instant at which the limit resets.
pub fn rate_limit_reset(status: StatusCode, headers: &HeaderMap) -> Option<DateTime<Utc>> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let remaining: i64 = header_str(headers, "x-ratelimit-remaining")?.trim().parse().ok()?;
    if remaining > 0 {
        return None;
    }
    let reset: i64 = header_str(headers, "x-ratelimit-reset")?.trim().parse().ok()?;
    DateTime::from_timestamp(reset, 0)
}

fn wait_for_reset(reset: DateTime<Utc>) {
    let wait = (reset - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    log::warn!(
        "waiting {} s for rate limit, will resume at {}",
        wait.as_secs(),
        reset.format("%Y-%m-%d %H:%M:%S")
    );
    std::thread::sleep(wait);
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct Response {
    pub body: Vec<u8>,
    pub next: Option<Url>,
}

/// Something that can GET API resources. Shared across backup workers.
pub trait Fetch: Sync {
    fn get(&self, url: &Url, media_type: &str) -> Result<Response>;
}

pub struct Client {
    http: reqwest::blocking::Client,
    credentials: Option<Credentials>,
    requests: AtomicUsize,
}

impl Client {
    pub fn new(credentials: Option<Credentials>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            credentials,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

impl Fetch for Client {
    fn get(&self, url: &Url, media_type: &str) -> Result<Response> {
        loop {
            let mut request = self.http.get(url.clone()).header(ACCEPT, media_type);
            if let Some(creds) = &self.credentials {
                request = request.basic_auth(&creds.username, Some(&creds.token));
            }
            self.requests.fetch_add(1, Ordering::Relaxed);

            let response = match request.send() {
                Ok(r) => r,
                Err(e) => {
                    log::error!("{url} => {e}");
                    return Err(e).with_context(|| format!("GET {url} failed"));
                }
            };

            let status = response.status();
            let headers = response.headers();
            log::info!(
                "{url} => {} {} {}/{}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                header_str(headers, "x-ratelimit-used").unwrap_or("?"),
                header_str(headers, "x-ratelimit-limit").unwrap_or("?"),
            );

            if let Some(reset) = rate_limit_reset(status, headers) {
                wait_for_reset(reset);
                continue;
            }
            if !status.is_success() {
                bail!("GET {url} returned {status}");
            }

            let next = headers
                .get_all(LINK)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(parse_next_link)
                .map(Url::parse)
                .transpose()
                .with_context(|| format!("malformed Link header from {url}"))?;
            let body = response
                .bytes()
                .with_context(|| format!("failed to read body of {url}"))?
                .to_vec();
            return Ok(Response { body, next });
        }
    }
}

/// Walks a paginated listing, yielding the JSON array of each page.
///
/// The first request drops any `page` parameter and asks for the largest page
/// size; later requests follow `rel="next"` links as given, provided they stay
/// on the same origin.
pub struct Pages<'a, F: ?Sized> {
    fetch: &'a F,
    media_type: &'a str,
    next: Option<Url>,
}

pub fn paginate<'a, F: Fetch + ?Sized>(
    fetch: &'a F,
    url: &Url,
    media_type: &'a str,
) -> Pages<'a, F> {
    let mut first = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page" && k != "per_page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    first
        .query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair("per_page", PER_PAGE);
    Pages {
        fetch,
        media_type,
        next: Some(first),
    }
}

impl<F: Fetch + ?Sized> Iterator for Pages<'_, F> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        let url = self.next.take()?;
        let response = match self.fetch.get(&url, self.media_type) {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        if let Some(next) = response.next {
            if let Err(e) = check_same_origin(&url, &next) {
                return Some(Err(e));
            }
            self.next = Some(next);
        }
        Some(
            serde_json::from_slice(&response.body)
                .with_context(|| format!("{url} did not return a JSON array")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::collections::HashMap;

    struct Canned(HashMap<String, Response>);

    impl Fetch for Canned {
        fn get(&self, url: &Url, _media_type: &str) -> Result<Response> {
            self.0
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| anyhow!("404 {url}"))
        }
    }

    fn page(body: &str, next: Option<&str>) -> Response {
        Response {
            body: body.as_bytes().to_vec(),
            next: next.map(|n| Url::parse(n).unwrap()),
        }
    }

    #[test]
    fn credentials_split_at_first_colon() {
        let c: Credentials = "alice:ghp_abc:def".parse().unwrap();
        assert_eq!(c.username, "alice");
        assert_eq!(c.token, "ghp_abc:def");
        assert!("alice".parse::<Credentials>().is_err());
        assert!(":token".parse::<Credentials>().is_err());
        assert!(!format!("{c:?}").contains("ghp_abc"));
    }

    #[test]
    fn repo_ref_parsing() {
        let r: RepoRef = "net4people/bbs".parse().unwrap();
        assert_eq!(r.owner, "net4people");
        assert_eq!(r.name, "bbs");
        assert_eq!(r.to_string(), "net4people/bbs");
        assert!("net4people".parse::<RepoRef>().is_err());
        assert!("/bbs".parse::<RepoRef>().is_err());
        assert!("net4people/".parse::<RepoRef>().is_err());
    }

    #[test]
    fn repo_url_escapes_segments() {
        let api = Url::parse(DEFAULT_API_URL).unwrap();
        let repo: RepoRef = "net4people/bbs".parse().unwrap();
        let url = repo_url(&api, &repo, &["issues", "comments"]).unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/repos/net4people/bbs/issues/comments");

        let odd = RepoRef {
            owner: "a b".to_string(),
            name: "c/d".to_string(),
        };
        let url = repo_url(&api, &odd, &["labels"]).unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/repos/a%20b/c%2Fd/labels");

        let enterprise = Url::parse("https://git.example.com/api/v3/").unwrap();
        let url = repo_url(&enterprise, &repo, &["issues"]).unwrap();
        assert_eq!(url.as_str(), "https://git.example.com/api/v3/repos/net4people/bbs/issues");
    }

    #[test]
    fn html_url_maps_public_api_host() {
        let repo: RepoRef = "net4people/bbs".parse().unwrap();
        let api = Url::parse(DEFAULT_API_URL).unwrap();
        assert_eq!(html_url(&api, &repo).unwrap().as_str(), "https://github.com/net4people/bbs/");
        let other = Url::parse("http://localhost:8080/api/v3/").unwrap();
        assert_eq!(
            html_url(&other, &repo).unwrap().as_str(),
            "http://localhost:8080/net4people/bbs/"
        );
    }

    #[test]
    fn next_link_is_found_among_others() {
        let header = r#"<https://api.github.com/repositories/1/issues?page=1>; rel="prev", <https://api.github.com/repositories/1/issues?page=3>; rel="next", <https://api.github.com/repositories/1/issues?page=5>; rel="last""#;
        assert_eq!(
            parse_next_link(header),
            Some("https://api.github.com/repositories/1/issues?page=3")
        );
        assert_eq!(parse_next_link(r#"<https://x/?page=1>; rel="first""#), None);
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn rate_limit_needs_exhausted_remaining() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1609459200"));

        let reset = rate_limit_reset(StatusCode::FORBIDDEN, &headers).unwrap();
        assert_eq!(reset.timestamp(), 1_609_459_200);
        assert!(rate_limit_reset(StatusCode::TOO_MANY_REQUESTS, &headers).is_some());
        assert!(rate_limit_reset(StatusCode::NOT_FOUND, &headers).is_none());

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("12"));
        assert!(rate_limit_reset(StatusCode::FORBIDDEN, &headers).is_none());

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("lots"));
        assert!(rate_limit_reset(StatusCode::FORBIDDEN, &headers).is_none());

        headers.remove("x-ratelimit-remaining");
        assert!(rate_limit_reset(StatusCode::FORBIDDEN, &headers).is_none());
    }

    #[test]
    fn paginate_follows_next_links() {
        let mut responses = HashMap::new();
        responses.insert(
            "https://api.github.com/items?sort=created&per_page=100".to_string(),
            page("[1, 2]", Some("https://api.github.com/items?sort=created&per_page=100&page=2")),
        );
        responses.insert(
            "https://api.github.com/items?sort=created&per_page=100&page=2".to_string(),
            page("[3]", None),
        );
        let fetch = Canned(responses);

        let start = Url::parse("https://api.github.com/items?page=7&sort=created").unwrap();
        let items: Vec<Value> = paginate(&fetch, &start, MEDIA_TYPE)
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(items, vec![Value::from(1), Value::from(2), Value::from(3)]);
    }

    #[test]
    fn paginate_rejects_foreign_next_link() {
        let mut responses = HashMap::new();
        responses.insert(
            "https://api.github.com/items?per_page=100".to_string(),
            page("[]", Some("https://evil.example.com/items?page=2")),
        );
        let fetch = Canned(responses);

        let start = Url::parse("https://api.github.com/items").unwrap();
        let mut pages = paginate(&fetch, &start, MEDIA_TYPE);
        let err = pages.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("same origin"));
        assert!(pages.next().is_none());
    }
}
