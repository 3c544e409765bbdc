use crate::errors::Error;
use crate::signer::TimedSigner;
use log::debug;
use serde_json::Value;
use std::time::Duration;

/// The coordinator allows long-running report queries; keep the client
/// timeout generous.
const REMOTE_TIMEOUT_SECS: u64 = 270;

/// Client side of the coordinator wire protocol. Signed POSTs live under
/// `/rpc/`, unsigned reads under `/api/`.
pub trait ScRpc: Send {
    /// Sign `data`, POST it to `rpc_url + "/rpc/" + path`, verify and return
    /// the signed response payload.
    fn post(&self, path: &str, data: Value) -> Result<Value, Error>;

    /// GET `rpc_url + path` and parse the body as plain JSON.
    fn get(&self, path: &str) -> Result<Value, Error>;
}

pub struct ScTransport {
    http: reqwest::blocking::Client,
    rpc_url: String,
    signer: TimedSigner,
    max_age: i64,
}

impl ScTransport {
    pub fn new(rpc_url: &str, signature: &str, max_age: i64) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REMOTE_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Transport(s!(e)))?;
        Ok(ScTransport {
            http,
            rpc_url: rpc_url.trim_end_matches('/').to_owned(),
            signer: TimedSigner::new(signature),
            max_age,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.rpc_url, path.trim_start_matches('/'))
    }
}

impl ScRpc for ScTransport {
    fn post(&self, path: &str, data: Value) -> Result<Value, Error> {
        let url = self.url(&format!("rpc/{}", path));
        debug!("Making signed request to {}", url);
        let body = self.signer.dumps(&data)?;
        let response = self.http.post(url.as_str()).body(body).send()?;
        let status = response.status();
        let text = response.text()?;
        if status.as_u16() != 200 {
            return Err(Error::Transport(format!(
                "non 200 from remote ({}): {}",
                status, text
            )));
        }
        debug!("Got {} from remote", text);
        self.signer.loads(&text, self.max_age)
    }

    fn get(&self, path: &str) -> Result<Value, Error> {
        let url = self.url(path);
        debug!("Making request to {}", url);
        let response = self.http.get(url.as_str()).send()?;
        let status = response.status();
        let text = response.text()?;
        if status.as_u16() != 200 {
            return Err(Error::Transport(format!(
                "non 200 from remote ({}): {}",
                status, text
            )));
        }
        serde_json::from_str(&text).map_err(|e| e.into())
    }
}
