use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Custom upstream status carrying a machine-readable resume instant.
const STATUS_THROTTLED_WITH_DEADLINE: u16 = 430;

/// Outcome of one upstream GET, classified by status. Transient variants are
/// retried by the caller; only `Ok` and `NotFound` are terminal.
#[derive(Debug)]
pub enum ApiResponse {
    Ok(Value),
    NotFound,
    /// 429/430. `retry_at` is present when the upstream named a resume
    /// instant (430 body, or a Retry-After header).
    RateLimited { retry_at: Option<DateTime<Utc>> },
    /// Any other status, or a transport/proxy failure (`status: None`).
    Transient { status: Option<u16> },
}

/// Thin client over the credential-injecting forwarding proxy. The proxy
/// owns auth headers and upstream host selection; this side only builds
/// shard-relative paths and classifies responses.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    proxy_base: String,
}

impl ApiClient {
    pub fn new(proxy_base: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            proxy_base: proxy_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn summoner_url(&self, platform: &str, summoner_id: &str) -> String {
        format!(
            "{}/{}/lol/summoner/v4/summoners/{}",
            self.proxy_base,
            platform.to_ascii_lowercase(),
            summoner_id
        )
    }

    pub fn match_ids_url(
        &self,
        region: &str,
        puuid: &str,
        start: i64,
        count: i64,
        start_time: i64,
        queue: Option<i32>,
    ) -> Result<String> {
        let raw = format!(
            "{}/{}/lol/match/v5/matches/by-puuid/{}/ids",
            self.proxy_base,
            region.to_ascii_lowercase(),
            puuid
        );
        let mut url = Url::parse(&raw).context("building match ids url")?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("count", &count.to_string());
            q.append_pair("start", &start.to_string());
            q.append_pair("startTime", &start_time.to_string());
            if let Some(queue) = queue {
                q.append_pair("queue", &queue.to_string());
            }
        }
        Ok(url.to_string())
    }

    /// Issue one GET and classify the response. Never errors: transport
    /// failures come back as `Transient` so callers retry uniformly.
    pub async fn get(&self, url: &str) -> ApiResponse {
        let resp = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "transport error");
                return ApiResponse::Transient { status: None };
            }
        };
        let status = resp.status();
        match status {
            StatusCode::OK => match resp.json::<Value>().await {
                Ok(v) => ApiResponse::Ok(v),
                Err(e) => {
                    debug!(error = %e, "undecodable 200 body");
                    ApiResponse::Transient { status: Some(200) }
                }
            },
            StatusCode::NOT_FOUND => ApiResponse::NotFound,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_at = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
                ApiResponse::RateLimited { retry_at }
            }
            s if s.as_u16() == STATUS_THROTTLED_WITH_DEADLINE => {
                let retry_at = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .as_ref()
                    .and_then(parse_retry_at);
                ApiResponse::RateLimited { retry_at }
            }
            s => ApiResponse::Transient {
                status: Some(s.as_u16()),
            },
        }
    }
}

/// 430 bodies carry `{"Retry-At": <epoch seconds>}`.
pub fn parse_retry_at(body: &Value) -> Option<DateTime<Utc>> {
    let raw = body.get("Retry-At")?;
    let secs = raw
        .as_i64()
        .or_else(|| raw.as_f64().map(|f| f as i64))
        .or_else(|| raw.as_str().and_then(|s| s.parse::<i64>().ok()))?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Routing region for the match-v5 endpoints; platform shards map onto four
/// continental clusters.
pub fn region_of(platform: &str) -> &'static str {
    match platform.to_ascii_uppercase().as_str() {
        "EUW1" | "EUN1" | "TR1" | "RU" => "europe",
        "NA1" | "BR1" | "LA1" | "LA2" => "americas",
        "KR" | "JP1" => "asia",
        "OC1" | "PH2" | "SG2" | "TH2" | "TW2" | "VN2" => "sea",
        _ => "americas",
    }
}

/// The slice of the summoner payload the pipeline persists.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummonerDto {
    pub puuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub revision_date: Option<i64>,
}

pub fn parse_summoner(body: Value) -> Result<SummonerDto> {
    serde_json::from_value(body).context("summoner payload shape")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_retry_at_variants() {
        let at = Utc::now().timestamp() + 5;
        assert_eq!(
            parse_retry_at(&json!({ "Retry-At": at })).map(|d| d.timestamp()),
            Some(at)
        );
        assert_eq!(
            parse_retry_at(&json!({ "Retry-At": at as f64 + 0.4 })).map(|d| d.timestamp()),
            Some(at)
        );
        assert!(parse_retry_at(&json!({ "status": "throttled" })).is_none());
    }

    #[test]
    fn maps_platforms_to_routing_regions() {
        assert_eq!(region_of("EUW1"), "europe");
        assert_eq!(region_of("euw1"), "europe");
        assert_eq!(region_of("KR"), "asia");
        assert_eq!(region_of("NA1"), "americas");
        assert_eq!(region_of("OC1"), "sea");
    }

    #[test]
    fn match_url_carries_pagination_params() {
        let api = ApiClient::new("http://proxy:8000", 30).unwrap();
        let url = api
            .match_ids_url("europe", "puuid-1", 200, 100, 1700000000, Some(420))
            .unwrap();
        assert!(url.starts_with("http://proxy:8000/europe/lol/match/v5/matches/by-puuid/puuid-1/ids?"));
        assert!(url.contains("count=100"));
        assert!(url.contains("start=200"));
        assert!(url.contains("startTime=1700000000"));
        assert!(url.contains("queue=420"));
    }

    #[test]
    fn summoner_payload_tolerates_missing_optionals() {
        let dto = parse_summoner(json!({ "puuid": "p-1" })).unwrap();
        assert_eq!(dto.puuid, "p-1");
        assert!(dto.name.is_none());
        assert!(dto.revision_date.is_none());
    }
}
