use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{parse_args, truncate_output, ToolError};

const MAX_BODY_BYTES: usize = 100_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_QUERY_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    allowed_domains: Vec<String>,
    #[serde(default)]
    blocked_domains: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    query: &'a str,
    allowed_domains: &'a [String],
    blocked_domains: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
    url: String,
    #[serde(default)]
    snippet: Option<String>,
}

pub(super) async fn fetch(input: &Value, client: &reqwest::Client) -> Result<String, ToolError> {
    let args: FetchArgs = parse_args(input)?;
    let url = Url::parse(&args.url)
        .map_err(|err| ToolError::InvalidArguments(format!("invalid url {}: {err}", args.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ToolError::InvalidArguments(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }

    let response = client
        .get(url.clone())
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|err| ToolError::Failed(format!("request to {url} failed: {err}")))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| ToolError::Failed(format!("failed to read body from {url}: {err}")))?;
    if !status.is_success() {
        let (body, _) = truncate_output(&body, 1_000);
        return Err(ToolError::Failed(format!("{url} returned HTTP {status}: {body}")));
    }
    let (mut body, truncated) = truncate_output(&body, MAX_BODY_BYTES);
    if truncated {
        body.push_str("\n[content truncated]");
    }
    Ok(body)
}

pub(super) async fn search(
    input: &Value,
    client: &reqwest::Client,
    endpoint: Option<&str>,
) -> Result<String, ToolError> {
    let args: SearchArgs = parse_args(input)?;
    let query = args.query.trim();
    if query.is_empty() {
        return Err(ToolError::InvalidArguments("query must not be empty".to_string()));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(ToolError::InvalidArguments(format!(
            "query exceeds {MAX_QUERY_CHARS} characters"
        )));
    }
    let Some(endpoint) = endpoint else {
        return Err(ToolError::Failed(
            "web search is not configured; set AGENTD_SEARCH_URL".to_string(),
        ));
    };

    let request = SearchRequest {
        query,
        allowed_domains: &args.allowed_domains,
        blocked_domains: &args.blocked_domains,
    };
    let response = client
        .post(endpoint)
        .timeout(REQUEST_TIMEOUT)
        .json(&request)
        .send()
        .await
        .map_err(|err| ToolError::Failed(format!("search request failed: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ToolError::Failed(format!("search returned HTTP {status}: {body}")));
    }
    let parsed: SearchResponse = response
        .json()
        .await
        .map_err(|err| ToolError::Failed(format!("failed to parse search response: {err}")))?;

    let hits: Vec<String> = parsed
        .results
        .into_iter()
        .filter(|hit| domain_permitted(&hit.url, &args.allowed_domains, &args.blocked_domains))
        .map(|hit| match hit.snippet {
            Some(snippet) if !snippet.is_empty() => format!("{}\n{}\n{}", hit.title, hit.url, snippet),
            _ => format!("{}\n{}", hit.title, hit.url),
        })
        .collect();
    if hits.is_empty() {
        return Ok(format!("No results for \"{query}\""));
    }
    Ok(hits.join("\n\n"))
}

fn domain_permitted(raw_url: &str, allowed: &[String], blocked: &[String]) -> bool {
    let Some(host) = Url::parse(raw_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
    else {
        return false;
    };
    let matches = |domain: &String| {
        let domain = domain.trim().to_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    };
    if blocked.iter().any(matches) {
        return false;
    }
    allowed.is_empty() || allowed.iter().any(matches)
}
