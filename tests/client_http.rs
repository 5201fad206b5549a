//! The real HTTP client against a local server.

use bbs_backup::github::{Client, Credentials, Fetch, MEDIA_TYPE};
use reqwest::Url;
use std::sync::mpsc;
use std::thread;
use tiny_http::{Header, Response, Server};

struct Seen {
    url: String,
    accept: Option<String>,
    authorization: Option<String>,
}

fn header_value(request: &tiny_http::Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_string())
}

type Reply = (u16, Vec<(String, String)>, &'static str);

/// Answers one request per scripted reply, in order, and reports what it saw.
fn serve(script: Vec<Reply>) -> (Url, mpsc::Receiver<Seen>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for (status, headers, body) in script {
            let Ok(request) = server.recv() else {
                return;
            };
            let seen = Seen {
                url: request.url().to_string(),
                accept: header_value(&request, "Accept"),
                authorization: header_value(&request, "Authorization"),
            };
            let mut response = Response::from_string(body).with_status_code(status);
            for (name, value) in headers {
                response.add_header(Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap());
            }
            let _ = request.respond(response);
            let _ = tx.send(seen);
        }
    });

    (Url::parse(&format!("http://{addr}/")).unwrap(), rx)
}

fn header(name: &str, value: &str) -> (String, String) {
    (name.to_string(), value.to_string())
}

#[test]
fn rate_limited_request_is_retried_then_errors_surface() {
    let next = "http://127.0.0.1:1/items?page=2";
    let (base, seen) = serve(vec![
        (
            403,
            vec![
                header("x-ratelimit-remaining", "0"),
                header("x-ratelimit-reset", "1"),
                header("x-ratelimit-used", "60"),
                header("x-ratelimit-limit", "60"),
            ],
            "rate limited",
        ),
        (
            200,
            vec![
                header("Content-Type", "application/json"),
                header("Link", &format!(r#"<{next}>; rel="next", <{next}>; rel="last""#)),
            ],
            "[]",
        ),
        (404, Vec::new(), "not found"),
    ]);

    let credentials: Credentials = "alice:secret".parse().unwrap();
    let client = Client::new(Some(credentials)).unwrap();
    let url = base.join("items?per_page=100").unwrap();

    let response = client.get(&url, MEDIA_TYPE).unwrap();
    assert_eq!(response.body, b"[]");
    assert_eq!(response.next.as_ref().map(Url::as_str), Some(next));
    assert_eq!(client.request_count(), 2);

    let first = seen.recv().unwrap();
    let retry = seen.recv().unwrap();
    assert_eq!(first.url, "/items?per_page=100");
    assert_eq!(retry.url, first.url);
    assert_eq!(retry.accept.as_deref(), Some(MEDIA_TYPE));
    // base64("alice:secret")
    assert_eq!(retry.authorization.as_deref(), Some("Basic YWxpY2U6c2VjcmV0"));

    let err = client.get(&base, MEDIA_TYPE).unwrap_err();
    assert!(err.to_string().contains("404"), "{err}");
    assert_eq!(client.request_count(), 3);
}

#[test]
fn forbidden_without_exhausted_limit_is_an_error() {
    let (base, _seen) = serve(vec![(
        403,
        vec![
            header("x-ratelimit-remaining", "4999"),
            header("x-ratelimit-reset", "1"),
        ],
        "forbidden",
    )]);

    let client = Client::new(None).unwrap();
    let err = client.get(&base, MEDIA_TYPE).unwrap_err();
    assert!(err.to_string().contains("403"), "{err}");
    assert_eq!(client.request_count(), 1);
}
