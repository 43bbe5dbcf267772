use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{parse_plan, Perception, Plan, Verdict};
use crate::error::PerceptionError;
use crate::logger;

#[derive(Deserialize)]
struct PlanReply {
    action: String,
}

#[derive(Deserialize)]
struct VerifyReply {
    matched: bool,
    #[serde(default)]
    state: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Deserialize)]
struct AskReply {
    answer: String,
}

#[derive(Deserialize)]
struct CheckpointReply {
    matched: bool,
}

/// Vision service reached over HTTP. Each call posts the raw screenshot
/// bytes with the text argument as a query parameter and reads back JSON.
pub struct HttpPerception {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpPerception {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(timeout_secs)))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: config.into(),
        }
    }

    fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        param: (&str, &str),
        screenshot: &[u8],
    ) -> Result<T, PerceptionError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut resp = self
            .agent
            .post(&url)
            .query(param.0, param.1)
            .header("Content-Type", "application/octet-stream")
            .send(screenshot)?;
        resp.body_mut()
            .read_json::<T>()
            .map_err(|e| PerceptionError::Malformed(format!("{}: {}", endpoint, e)))
    }
}

impl Perception for HttpPerception {
    fn plan(&mut self, screenshot: &[u8], goal: &str) -> Result<Plan, PerceptionError> {
        let reply: PlanReply = self.post("plan", ("goal", goal), screenshot)?;
        logger::info_p("perception", &format!("plan reply: {}", reply.action));
        parse_plan(&reply.action)
    }

    fn verify(&mut self, screenshot: &[u8], target: &str) -> Result<Verdict, PerceptionError> {
        let reply: VerifyReply = self.post("verify", ("target", target), screenshot)?;
        Ok(Verdict { matched: reply.matched, state: reply.state, has_more: reply.has_more })
    }

    fn ask(&mut self, screenshot: &[u8], question: &str) -> Result<String, PerceptionError> {
        let reply: AskReply = self.post("ask", ("question", question), screenshot)?;
        Ok(reply.answer)
    }

    fn checkpoint(&mut self, screenshot: &[u8], description: &str) -> Result<bool, PerceptionError> {
        let reply: CheckpointReply = self.post("checkpoint", ("description", description), screenshot)?;
        Ok(reply.matched)
    }
}
