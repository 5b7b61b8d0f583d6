use serde::Serialize;

const FAVICON_URL: &str = "https://workers.cloudflare.com/favicon.ico";
const FRONTEND: &str = "devtools://devtools/bundled/js_app.html?experiments=true&v8only=true&ws=";
const FRONTEND_COMPAT: &str =
    "devtools://devtools/bundled/inspector.html?experiments=true&v8only=true&ws=";

/// One entry of the `/json` discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub web_socket_debugger_url: String,
    pub devtools_frontend_url: String,
    pub devtools_frontend_url_compat: String,
    pub favicon_url: String,
}

impl TargetDescriptor {
    /// `host` is the authority the client used to reach the inspector port,
    /// so the advertised URLs work through port forwards.
    pub fn new(name: &str, host: &str) -> Self {
        let address = format!("{}/worker/{}", host, urlencoding::encode(name));
        let encoded = urlencoding::encode(&address);
        Self {
            id: format!("worker-{}", name),
            kind: "node".to_string(),
            title: name.to_string(),
            description: format!("devmesh worker {}", name),
            url: "https://workers.dev".to_string(),
            web_socket_debugger_url: format!("ws://{}", address),
            devtools_frontend_url: format!("{}{}", FRONTEND, encoded),
            devtools_frontend_url_compat: format!("{}{}", FRONTEND_COMPAT, encoded),
            favicon_url: FAVICON_URL.to_string(),
        }
    }
}

/// Body of `/json/version`.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            browser: format!("devmesh/v{}", env!("CARGO_PKG_VERSION")),
            protocol_version: "1.3".to_string(),
        }
    }
}
