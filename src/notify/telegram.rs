//! Telegram Bot API transport.
//!
//! `TelegramNotifier` owns a small pool of delivery threads fed by a bounded
//! `sync_channel`. `send_alert` only ever does a `try_send`; a full queue or a
//! stopped pool is reported back as `NotifierUnavailable` and the alert is
//! dropped. Delivery failures after hand-off are logged and otherwise ignored.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::Rng;

use super::Notifier;
use crate::error::PipelineError;
use crate::store::lock;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

const CAPTION_TITLE: &str = "SAFETY ALERT";
const CAPTION_BODY: &str = "A person without a safety helmet was detected.";
const CAPTION_FOOTER: &str = "Automatic monitoring system.";

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Base URL of the Bot API, without trailing slash.
    pub api_base: String,
    pub workers: usize,
    pub queue_depth: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            workers: 2,
            queue_depth: 8,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
        }
    }
}

struct AlertJob {
    jpeg: Vec<u8>,
    chat_id: String,
    caption: String,
}

pub struct TelegramNotifier {
    sender: Mutex<Option<SyncSender<AlertJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TelegramNotifier {
    /// Spawn the delivery pool.
    pub fn start(config: TelegramConfig) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(anyhow!("telegram bot token must not be empty"));
        }
        let (sender, receiver) = mpsc::sync_channel::<AlertJob>(config.queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.request_timeout)
            .build();
        let url = format!(
            "{}/bot{}/sendPhoto",
            config.api_base.trim_end_matches('/'),
            config.bot_token
        );

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for index in 0..config.workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let agent = agent.clone();
            let url = url.clone();
            let handle = thread::Builder::new()
                .name(format!("helmet-notify-{index}"))
                .spawn(move || delivery_loop(receiver, agent, url))
                .context("spawn notifier worker")?;
            workers.push(handle);
        }
        log::info!(
            "notifier: telegram pool started ({} workers, queue {})",
            workers.len(),
            config.queue_depth.max(1)
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }
}

impl Notifier for TelegramNotifier {
    fn send_alert(&self, jpeg: Vec<u8>, destination: &str) -> Result<(), PipelineError> {
        let chat_id = destination.trim();
        if chat_id.is_empty() {
            return Err(PipelineError::NotifierUnavailable(
                "no chat id configured".to_string(),
            ));
        }
        let guard = lock(&self.sender);
        let sender = guard.as_ref().ok_or_else(|| {
            PipelineError::NotifierUnavailable("notifier has been shut down".to_string())
        })?;
        let job = AlertJob {
            jpeg,
            chat_id: chat_id.to_string(),
            caption: alert_caption(chrono::Local::now()),
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PipelineError::NotifierUnavailable(
                "delivery queue is full".to_string(),
            )),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::NotifierUnavailable(
                "delivery workers have stopped".to_string(),
            )),
        }
    }

    fn is_available(&self) -> bool {
        lock(&self.sender).is_some()
    }

    /// Drops the queue sender; workers finish what is queued and exit.
    fn shutdown(&self) {
        if lock(&self.sender).take().is_none() {
            return;
        }
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                log::error!("notifier: delivery worker panicked");
            }
        }
        log::info!("notifier: telegram pool stopped");
    }
}

fn delivery_loop(receiver: Arc<Mutex<Receiver<AlertJob>>>, agent: ureq::Agent, url: String) {
    loop {
        let job = {
            let guard = lock(&receiver);
            guard.recv()
        };
        let Ok(job) = job else {
            return;
        };
        match deliver(&agent, &url, &job) {
            Ok(()) => log::info!("notifier: alert delivered to chat {}", job.chat_id),
            Err(err) => log::error!(
                "notifier: delivery to chat {} failed: {:#}",
                job.chat_id,
                err
            ),
        }
    }
}

fn deliver(agent: &ureq::Agent, url: &str, job: &AlertJob) -> Result<()> {
    let boundary = multipart_boundary(job);
    let body = multipart_body(&boundary, job);
    let response = match agent
        .post(url)
        .set(
            "Content-Type",
            &format!("multipart/form-data; boundary={boundary}"),
        )
        .send_bytes(&body)
    {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            let text = response.into_string().unwrap_or_default();
            return Err(anyhow!("bot api returned HTTP {code}: {}", describe_error(&text)));
        }
        Err(err) => return Err(anyhow::Error::new(err).context("send photo request")),
    };
    let text = response.into_string().context("read bot api response")?;
    let parsed: serde_json::Value =
        serde_json::from_str(&text).context("parse bot api response")?;
    if parsed.get("ok").and_then(|ok| ok.as_bool()) != Some(true) {
        return Err(anyhow!("bot api rejected photo: {}", describe_error(&text)));
    }
    Ok(())
}

fn describe_error(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn multipart_boundary(job: &AlertJob) -> String {
    let mut rng = rand::thread_rng();
    pick_boundary(|| rng.gen(), job)
}

/// First candidate boundary that occurs in none of the form values.
fn pick_boundary(mut next: impl FnMut() -> u64, job: &AlertJob) -> String {
    loop {
        let candidate = format!("helmet-guard-{:016x}", next());
        let marker = candidate.as_bytes();
        let collides = [job.jpeg.as_slice(), job.chat_id.as_bytes(), job.caption.as_bytes()]
            .iter()
            .any(|part| part.windows(marker.len()).any(|window| window == marker));
        if !collides {
            return candidate;
        }
    }
}

fn multipart_body(boundary: &str, job: &AlertJob) -> Vec<u8> {
    let mut body = Vec::with_capacity(job.jpeg.len() + 512);
    for (name, value) in [("chat_id", job.chat_id.as_str()), ("caption", job.caption.as_str())] {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"alert.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&job.jpeg);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

pub(crate) fn alert_caption<Tz>(now: chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{CAPTION_TITLE}\n\n{CAPTION_BODY}\nDate and time: {}\n{CAPTION_FOOTER}",
        now.format("%d/%m/%Y %H:%M:%S")
    )
}
