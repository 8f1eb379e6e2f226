//! Client for the gacha-log web service.
//!
//! Auth material is lifted from the game client's own logfile rather than
//! typed in by hand, and the service only serves small pages, so collection
//! walks pages oldest-to-newest-id with a caller-supplied progress hook.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use url::Url;

use wishkit_core::{record_from_row, GachaType, Wish};

/// The gacha-log history endpoint.
pub const API_ENDPOINT: &str =
    "https://hk4e-api.mihoyo.com/event/gacha_info/api/getGachaLog";

/// Largest page the service will return.
pub const PAGE_SIZE_MAX: u32 = 20;

/// The banners the service answers for. Character event wish 2 records come
/// back inside the `301` pages, so it is not requested separately.
pub const FETCH_POOLS: [GachaType; 4] = [
    GachaType::Beginner,
    GachaType::Standard,
    GachaType::CharacterEvent,
    GachaType::WeaponEvent,
];

const AUTH_LINE_PREFIX: &str = "OnGetWebViewPageFinish:";

const LOGFILE_CANDIDATES: [&str; 3] = ["原神", "Genshin Impact", "YuanShen"];

/// Top-level service reply. A non-zero `retcode` means the request was
/// understood but refused, with the reason in `message`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    pub retcode: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Payload of a successful page request. The numeric bookkeeping fields the
/// service also sends are not interesting here.
#[derive(Debug, Deserialize)]
pub struct PageData {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub list: Vec<Value>,
}

/// Parameters of the page request that just finished, handed to the
/// progress hook. `end_id` is the cursor the page was requested with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub gacha_type: GachaType,
    pub size: u32,
    pub page: u32,
    pub end_id: String,
}

/// Auth-carrying client for the gacha-log service.
pub struct GachaLogClient {
    agent: ureq::Agent,
    endpoint: Url,
    auths: Vec<(String, String)>,
}

impl GachaLogClient {
    /// Builds a client from a full web-view url, keeping every query pair as
    /// auth material.
    ///
    /// # Errors
    ///
    /// Fails when the url does not parse or carries no `authkey`.
    pub fn from_auth_url(raw: &str) -> Result<Self> {
        let url =
            Url::parse(raw).with_context(|| format!("auth url does not parse: {raw}"))?;
        let pairs = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        Self::from_query_pairs(pairs)
    }

    /// Builds a client from already-decoded query pairs, as produced by
    /// [`extract_auths`].
    ///
    /// # Errors
    ///
    /// Fails when the pairs carry no `authkey`.
    pub fn from_query_pairs(pairs: Vec<(String, String)>) -> Result<Self> {
        if !pairs.iter().any(|(key, _)| key == "authkey") {
            return Err(anyhow!("auth parameters carry no authkey"));
        }
        let endpoint =
            Url::parse(API_ENDPOINT).context("failed to parse gacha-log endpoint")?;
        Ok(Self {
            agent: ureq::agent(),
            endpoint,
            auths: pairs,
        })
    }

    /// Probes the service with a one-row request to check whether the auth
    /// material is still accepted.
    ///
    /// # Errors
    ///
    /// Fails on transport problems, or with the service's own message when
    /// the auth is refused (typically an expired `authkey`).
    pub fn available(&self) -> Result<()> {
        let envelope = self.fetch_envelope(GachaType::Beginner, 1, 1, "0")?;
        if envelope.retcode != 0 {
            return Err(anyhow!(
                "auth rejected by the gacha-log service: {}",
                envelope.message
            ));
        }
        Ok(())
    }

    /// Fetches one page of history for a banner.
    ///
    /// # Errors
    ///
    /// Fails on transport problems, a non-zero `retcode`, or a payload that
    /// does not have the expected shape.
    pub fn page(
        &self,
        gacha_type: GachaType,
        size: u32,
        page: u32,
        end_id: &str,
    ) -> Result<PageData> {
        let envelope = self.fetch_envelope(gacha_type, size, page, end_id)?;
        if envelope.retcode != 0 {
            return Err(anyhow!(
                "gacha-log service returned retcode {}: {}",
                envelope.retcode,
                envelope.message
            ));
        }
        let data = envelope
            .data
            .ok_or_else(|| anyhow!("gacha-log response carries no data payload"))?;
        serde_json::from_value(data).context("gacha-log data payload has an unexpected shape")
    }

    /// Walks every page of one banner's history into a [`Wish`].
    ///
    /// Pages are requested newest-first with the previous page's last id as
    /// the cursor. The hook runs once per downloaded page, the terminating
    /// empty one included, so callers can report progress and pace every
    /// request.
    ///
    /// # Errors
    ///
    /// Fails on the first page that cannot be fetched or whose rows do not
    /// parse.
    pub fn collect<F>(&self, gacha_type: GachaType, mut after_page: F) -> Result<Wish>
    where
        F: FnMut(&PageInfo),
    {
        let mut wish = Wish::scoped(gacha_type);
        let mut page_number = 1_u32;
        let mut end_id = "0".to_string();
        loop {
            let PageData { region, list } =
                self.page(gacha_type, PAGE_SIZE_MAX, page_number, &end_id)?;
            after_page(&PageInfo {
                gacha_type,
                size: PAGE_SIZE_MAX,
                page: page_number,
                end_id: end_id.clone(),
            });
            if !region.is_empty() {
                wish.region = region;
            }
            if list.is_empty() {
                break;
            }
            let mut batch = Vec::with_capacity(list.len());
            for row in &list {
                let record = record_from_row(row).with_context(|| {
                    format!(
                        "bad gacha-log row on page {page_number} of banner {}",
                        gacha_type.code()
                    )
                })?;
                batch.push(record);
            }
            if let Some(last) = batch.last() {
                end_id.clone_from(&last.id);
                wish.uid.clone_from(&last.uid);
                wish.language.clone_from(&last.item.lang);
            }
            tracing::info!(
                banner = gacha_type.code(),
                page = page_number,
                rows = batch.len(),
                "fetched gacha-log page"
            );
            wish.extend(batch);
            page_number += 1;
        }
        Ok(wish)
    }

    fn fetch_envelope(
        &self,
        gacha_type: GachaType,
        size: u32,
        page: u32,
        end_id: &str,
    ) -> Result<ApiEnvelope> {
        let url = self.page_url(gacha_type, size, page, end_id);
        tracing::debug!(
            banner = gacha_type.code(),
            page,
            end_id,
            "requesting gacha-log page"
        );
        let response = self
            .agent
            .get(url.as_str())
            .call()
            .context("gacha-log request failed")?;
        response
            .into_json()
            .context("gacha-log response is not valid JSON")
    }

    fn page_url(&self, gacha_type: GachaType, size: u32, page: u32, end_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .extend_pairs(&self.auths)
            .append_pair("gacha_type", gacha_type.code())
            .append_pair("size", &size.to_string())
            .append_pair("page", &page.to_string())
            .append_pair("end_id", end_id)
            .finish();
        url
    }
}

/// Earliest wall-clock moment the service can still answer for. History is
/// kept for roughly six months and silently dropped beyond that.
#[must_use]
pub fn earliest_reachable() -> PrimitiveDateTime {
    let cutoff = OffsetDateTime::now_utc() - Duration::days(6 * 30 - 1);
    PrimitiveDateTime::new(cutoff.date(), cutoff.time())
}

/// Probes the known client install names for an `output_log.txt`.
///
/// # Errors
///
/// Fails when no home directory is available or none of the candidate paths
/// exists.
pub fn find_logfile() -> Result<PathBuf> {
    let Some(home) = std::env::var_os("USERPROFILE").or_else(|| std::env::var_os("HOME"))
    else {
        return Err(anyhow!("no home directory available to locate the client logfile"));
    };
    let base = PathBuf::from(home)
        .join("AppData")
        .join("LocalLow")
        .join("miHoYo");
    for candidate in LOGFILE_CANDIDATES {
        let path = base.join(candidate).join("output_log.txt");
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(anyhow!("no client logfile found under {}", base.display()))
}

/// Reverse-scans a client logfile for the newest web-view url and returns
/// its decoded query pairs.
///
/// # Errors
///
/// Fails when the file cannot be read, no web-view line is present, or the
/// recorded url does not parse.
pub fn extract_auths(path: &Path) -> Result<Vec<(String, String)>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read client logfile {}", path.display()))?;
    let Some(line) = body
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with(AUTH_LINE_PREFIX))
    else {
        return Err(anyhow!(
            "no auth url recorded in client logfile {}",
            path.display()
        ));
    };
    let raw = line.trim_start_matches(AUTH_LINE_PREFIX).trim();
    let url =
        Url::parse(raw).with_context(|| format!("auth url in logfile does not parse: {raw}"))?;
    Ok(url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_log_path(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!(
            "wishkit-fetch-{tag}-{}-{nanos}.txt",
            std::process::id()
        ))
    }

    fn auth_url(authkey: &str) -> String {
        format!(
            "https://webstatic.mihoyo.com/hk4e/event/e20190909gacha/index.html?win_mode=fullscreen&authkey_ver=1&authkey={authkey}&game_biz=hk4e_cn&lang=zh-cn#/log"
        )
    }

    fn vendor_row(id: &str, time: &str, name: &str) -> Value {
        json!({
            "uid": "100000042",
            "gacha_type": "301",
            "item_id": "",
            "count": "1",
            "time": time,
            "name": name,
            "lang": "en-us",
            "item_type": "Character",
            "rank_type": "5",
            "id": id,
        })
    }

    // Serves the canned bodies in order on a local listener, one per request.
    fn serve_pages(bodies: Vec<String>) -> (String, std::thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to start page stub: {err}"));
        let Some(addr) = server.server_addr().to_ip() else {
            panic!("page stub bound to no ip address");
        };
        let handle = std::thread::spawn(move || {
            for body in bodies {
                let Ok(Some(request)) =
                    server.recv_timeout(std::time::Duration::from_secs(10))
                else {
                    return;
                };
                let response = tiny_http::Response::from_string(body).with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .unwrap_or_else(|()| panic!("content-type header must parse")),
                );
                let _ = request.respond(response);
            }
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn envelope_decodes_vendor_refusal() -> Result<()> {
        let envelope: ApiEnvelope = serde_json::from_value(json!({
            "retcode": -101,
            "message": "authkey timeout",
            "data": null,
        }))?;
        assert_eq!(envelope.retcode, -101);
        assert_eq!(envelope.message, "authkey timeout");
        assert!(envelope.data.is_none());
        Ok(())
    }

    #[test]
    fn page_data_keeps_region_and_rows() -> Result<()> {
        let data: PageData = serde_json::from_value(json!({
            "page": "1",
            "size": "20",
            "total": "0",
            "region": "cn_gf01",
            "list": [
                {
                    "uid": "100000042",
                    "gacha_type": "301",
                    "item_id": "",
                    "count": "1",
                    "time": "2023-01-01 12:00:00",
                    "name": "Qiqi",
                    "lang": "zh-cn",
                    "item_type": "Character",
                    "rank_type": "5",
                    "id": "1672531200000000001",
                }
            ],
        }))?;
        assert_eq!(data.region, "cn_gf01");
        assert_eq!(data.list.len(), 1);
        let record = record_from_row(&data.list[0])?;
        assert_eq!(record.item.name, "Qiqi");
        assert_eq!(record.gacha_type, GachaType::CharacterEvent);
        Ok(())
    }

    #[test]
    fn client_requires_an_authkey() {
        let Err(err) = GachaLogClient::from_auth_url(
            "https://webstatic.mihoyo.com/index.html?game_biz=hk4e_cn&lang=zh-cn",
        ) else {
            panic!("url without authkey must be refused");
        };
        assert!(err.to_string().contains("authkey"));

        let Err(err) = GachaLogClient::from_auth_url("definitely not a url") else {
            panic!("unparseable auth url must be refused");
        };
        assert!(err.to_string().contains("does not parse"));
    }

    #[test]
    fn client_decodes_percent_escaped_auth_material() -> Result<()> {
        let client = GachaLogClient::from_auth_url(&auth_url("x%2Fy%3D%3D"))?;
        let authkey = client
            .auths
            .iter()
            .find(|(key, _)| key == "authkey")
            .map(|(_, value)| value.clone());
        assert_eq!(authkey.as_deref(), Some("x/y=="));
        Ok(())
    }

    #[test]
    fn page_url_layers_auth_and_page_params() -> Result<()> {
        let client = GachaLogClient::from_auth_url(&auth_url("k3y"))?;
        let url = client.page_url(GachaType::WeaponEvent, 20, 3, "1672531200000000001");
        assert!(url.as_str().starts_with(API_ENDPOINT));
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        let lookup = |wanted: &str| {
            pairs
                .iter()
                .find(|(key, _)| key == wanted)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(lookup("authkey").as_deref(), Some("k3y"));
        assert_eq!(lookup("lang").as_deref(), Some("zh-cn"));
        assert_eq!(lookup("gacha_type").as_deref(), Some("302"));
        assert_eq!(lookup("size").as_deref(), Some("20"));
        assert_eq!(lookup("page").as_deref(), Some("3"));
        assert_eq!(lookup("end_id").as_deref(), Some("1672531200000000001"));
        Ok(())
    }

    #[test]
    fn collect_hooks_every_downloaded_page() -> Result<()> {
        let first = json!({
            "retcode": 0,
            "message": "OK",
            "data": {
                "page": "1",
                "size": "20",
                "total": "2",
                "region": "os_euro",
                "list": [
                    vendor_row("1672617600000000002", "2023-01-02 12:00:00", "Qiqi"),
                    vendor_row("1672531200000000001", "2023-01-01 12:00:00", "Keqing"),
                ],
            },
        })
        .to_string();
        let second = json!({
            "retcode": 0,
            "message": "OK",
            "data": {"page": "2", "size": "20", "total": "2", "region": "os_euro", "list": []},
        })
        .to_string();

        let (base, handle) = serve_pages(vec![first, second]);
        let client = GachaLogClient {
            agent: ureq::agent(),
            endpoint: Url::parse(&base)
                .unwrap_or_else(|err| panic!("page stub url does not parse: {err}")),
            auths: vec![("authkey".to_string(), "k3y".to_string())],
        };

        let mut seen: Vec<PageInfo> = Vec::new();
        let wish = client.collect(GachaType::CharacterEvent, |info| seen.push(info.clone()))?;
        handle
            .join()
            .unwrap_or_else(|_| panic!("page stub thread panicked"));

        assert_eq!(wish.records.len(), 2);
        assert_eq!(wish.region, "os_euro");
        assert_eq!(wish.uid, "100000042");
        assert_eq!(wish.language, "en-us");

        let pages: Vec<u32> = seen.iter().map(|info| info.page).collect();
        assert_eq!(pages, [1, 2]);
        assert_eq!(seen[0].end_id, "0");
        // the terminating empty page reaches the hook too, cursored at the
        // last id of the full page before it
        assert_eq!(seen[1].end_id, "1672531200000000001");
        Ok(())
    }

    #[test]
    fn extract_auths_takes_the_newest_webview_line() -> Result<()> {
        let path = temp_log_path("newest");
        let body = format!(
            "Loading player data\n{}{}\nWarmup shader cache\n  {}{}\nUnloadTime: 0.8\n",
            AUTH_LINE_PREFIX,
            auth_url("stale"),
            AUTH_LINE_PREFIX,
            auth_url("fresh%2Bone"),
        );
        fs::write(&path, body)?;
        let pairs = extract_auths(&path)?;
        fs::remove_file(&path)?;
        let authkey = pairs
            .iter()
            .find(|(key, _)| key == "authkey")
            .map(|(_, value)| value.clone());
        assert_eq!(authkey.as_deref(), Some("fresh+one"));
        assert!(pairs.iter().any(|(key, value)| key == "game_biz" && value == "hk4e_cn"));
        Ok(())
    }

    #[test]
    fn extract_auths_without_webview_line_fails() -> Result<()> {
        let path = temp_log_path("no-marker");
        fs::write(&path, "Loading player data\nUnloadTime: 0.8\n")?;
        let outcome = extract_auths(&path);
        fs::remove_file(&path)?;
        let Err(err) = outcome else {
            panic!("logfile without a web-view line must be refused");
        };
        assert!(err.to_string().contains("no auth url"));
        Ok(())
    }

    #[test]
    fn extract_auths_reports_unreadable_file() {
        let path = temp_log_path("absent");
        let Err(err) = extract_auths(&path) else {
            panic!("missing logfile must be reported");
        };
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn earliest_reachable_sits_six_months_back() {
        let earliest = earliest_reachable().assume_utc();
        let days = (OffsetDateTime::now_utc() - earliest).whole_days();
        assert_eq!(days, 179);
    }

    #[test]
    fn fetch_pools_cover_the_served_banners() {
        let codes: Vec<&str> = FETCH_POOLS.iter().map(|pool| pool.code()).collect();
        assert_eq!(codes, ["100", "200", "301", "302"]);
    }
}
