//! Dispatch example: guarding a small set of endpoints.
//!
//! Simulates the request handling a web front controller would do: every
//! request is rate limited per action, state-changing requests must carry
//! the session's anti-forgery token, and rejections become 403/429
//! responses. Audit entries are written to a temporary directory.
//!
//! Run with: `cargo run --example dispatch`

use access_guard::{Guard, GuardConfig, RequestIdentity, SecurityRejection, SessionRequest};
use std::net::IpAddr;
use tracing_subscriber::prelude::*;

struct Request<'a> {
    action: &'a str,
    cookie: Option<String>,
    form_token: Option<String>,
}

struct Response {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
}

fn dispatch(guard: &Guard, identity: &RequestIdentity, request: Request<'_>) -> Response {
    let mut session = guard.open_session(
        SessionRequest {
            cookie: request.cookie,
            user_agent: Some("demo-browser/1.0".to_string()),
            encrypted: true,
        },
        identity,
    );

    let result = (|| -> Result<String, SecurityRejection> {
        let remaining = match guard.check(request.action, identity) {
            Ok(decision) => decision.into_result()?,
            Err(_) => return Ok(format!("unknown action {}", request.action)),
        };
        if request.action == "share" {
            session.require_token(request.form_token.as_deref())?;
        }
        let visits: u32 = session.get("visits", 0);
        session.set("visits", &(visits + 1));
        Ok(format!("{} ok ({} left, visit {})", request.action, remaining, visits + 1))
    })();

    let mut headers = Vec::new();
    if let Some(cookie) = session.take_cookie() {
        headers.push(("Set-Cookie", cookie.to_header_value()));
    }
    match result {
        Ok(body) => Response {
            status: 200,
            headers,
            body,
        },
        Err(rejection) => {
            if let Some(secs) = rejection.retry_after_secs() {
                headers.push(("Retry-After", secs.to_string()));
            }
            Response {
                status: rejection.status_code(),
                headers,
                body: rejection.to_string(),
            }
        }
    }
}

fn cookie_value(response: &Response) -> Option<String> {
    response
        .headers
        .iter()
        .find(|(name, _)| *name == "Set-Cookie")
        .and_then(|(_, value)| value.split(';').next())
        .and_then(|pair| pair.split_once('='))
        .map(|(_, value)| value.to_string())
}

fn print(response: &Response) {
    println!("  {} {}", response.status, response.body);
    for (name, value) in &response.headers {
        println!("    {}: {}", name, value);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let log_dir = tempfile::tempdir()?;
    let mut config = GuardConfig::from_toml_str(
        r#"
        [identity]
        salt = "demo"

        [rate_limit.actions.search]
        limit = 3
        window_secs = 60

        [rate_limit.actions.share]
        limit = 2
        window_secs = 60
        "#,
    )?;
    config.audit.dir = Some(log_dir.path().to_path_buf());
    let guard = Guard::from_config(&config)?;

    let address: IpAddr = "203.0.113.7".parse()?;
    let visitor = guard.identify(address, None);

    println!("=== Searching until rate limited ===\n");
    let mut cookie = None;
    for _ in 0..5 {
        let response = dispatch(
            &guard,
            &visitor,
            Request {
                action: "search",
                cookie: cookie.clone(),
                form_token: None,
            },
        );
        print(&response);
        cookie = cookie_value(&response).or(cookie);
    }

    println!("\n=== Sharing without and with a token ===\n");
    let token = guard
        .open_session(
            SessionRequest {
                cookie: cookie.clone(),
                user_agent: Some("demo-browser/1.0".to_string()),
                encrypted: true,
            },
            &visitor,
        )
        .get_token();
    for form_token in [None, token] {
        print(&dispatch(
            &guard,
            &visitor,
            Request {
                action: "share",
                cookie: cookie.clone(),
                form_token,
            },
        ));
    }

    println!("\n=== Audit log ===\n");
    for file in guard.audit().list_files()? {
        println!("  {} ({} bytes)", file.path.display(), file.size);
        let text = std::fs::read_to_string(log_dir.path().join(&file.path))?;
        for line in text.lines() {
            println!("    {}", line);
        }
    }

    let metrics = guard.limiter().metrics().snapshot();
    println!(
        "\nChecks: {} allowed, {} limited, {} blocks issued",
        metrics.checks_allowed, metrics.checks_limited, metrics.blocks_issued
    );
    Ok(())
}
