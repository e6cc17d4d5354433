//! W3C WebDriver implementation of the browser session.
//!
//! Each [`WebDriverPage`] is a window handle inside one WebDriver session.
//! Commands are serialized through a shared lock so that switching to the
//! page's window and issuing the command happen together.

use crate::browser::{BrowserPage, BrowserSession, Point};
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const ENTER_KEY: &str = "\u{E007}";

#[derive(Debug, Clone)]
pub struct WebDriverOptions {
    pub endpoint: String,
    pub headless: bool,
    pub browser_name: String,
    pub window_size: (u32, u32),
    pub command_timeout: Duration,
}

impl Default for WebDriverOptions {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            headless: true,
            browser_name: "chrome".to_string(),
            window_size: (1600, 1000),
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl WebDriverOptions {
    fn capabilities(&self) -> Value {
        let mut args = vec![format!(
            "--window-size={},{}",
            self.window_size.0, self.window_size.1
        )];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.push("--disable-dev-shm-usage".to_string());
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": self.browser_name,
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

struct Wire {
    client: Client,
    endpoint: String,
}

impl Wire {
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.endpoint, path);
        debug!("WebDriver {} {}", method, path);

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let payload: Value = response.json().await?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if !status.is_success() {
            let body: WireErrorBody =
                serde_json::from_value(value).unwrap_or_else(|_| WireErrorBody {
                    error: "unknown error".to_string(),
                    message: String::new(),
                });
            return Err(ScanError::WebDriver {
                status: status.as_u16(),
                error: body.error,
                message: body.message,
            });
        }
        Ok(value)
    }
}

/// Which window the WebDriver session currently targets.
struct Focus {
    session_id: String,
    active: Option<String>,
}

pub struct WebDriverSession {
    wire: Arc<Wire>,
    options: WebDriverOptions,
    focus: Arc<Mutex<Focus>>,
    page_counter: std::sync::atomic::AtomicUsize,
}

impl WebDriverSession {
    /// Starts a session and returns it together with its initial page.
    pub async fn connect(options: WebDriverOptions) -> Result<(Self, Arc<dyn BrowserPage>)> {
        let client = Client::builder()
            .timeout(options.command_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let wire = Arc::new(Wire {
            client,
            endpoint: options.endpoint.trim_end_matches('/').to_string(),
        });

        let (session_id, handle) = Self::start(&wire, &options).await?;
        info!(session = %session_id, "WebDriver session started");

        let session = Self {
            wire,
            options,
            focus: Arc::new(Mutex::new(Focus {
                session_id,
                active: Some(handle.clone()),
            })),
            page_counter: std::sync::atomic::AtomicUsize::new(0),
        };
        let page = session.page_for(handle).await;
        Ok((session, page))
    }

    async fn start(wire: &Wire, options: &WebDriverOptions) -> Result<(String, String)> {
        let created = wire
            .call(Method::POST, "/session", Some(options.capabilities()))
            .await?;
        let session_id = created
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::ParseError("session response without sessionId".into()))?
            .to_string();
        let handle = wire
            .call(Method::GET, &format!("/session/{session_id}/window"), None)
            .await?;
        let handle = handle
            .as_str()
            .ok_or_else(|| ScanError::ParseError("window handle is not a string".into()))?
            .to_string();
        Ok((session_id, handle))
    }

    async fn page_for(&self, handle: String) -> Arc<dyn BrowserPage> {
        let n = self
            .page_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let session_id = self.focus.lock().await.session_id.clone();
        Arc::new(WebDriverPage {
            wire: self.wire.clone(),
            focus: self.focus.clone(),
            session_id,
            handle,
            id: format!("page-{n}"),
        })
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn new_page(&self) -> Result<Arc<dyn BrowserPage>> {
        let session_id = self.focus.lock().await.session_id.clone();
        let created = self
            .wire
            .call(
                Method::POST,
                &format!("/session/{session_id}/window/new"),
                Some(json!({ "type": "tab" })),
            )
            .await?;
        let handle = created
            .get("handle")
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::ParseError("new window response without handle".into()))?
            .to_string();
        Ok(self.page_for(handle).await)
    }

    async fn relaunch(&self) -> Result<Arc<dyn BrowserPage>> {
        let old_session = self.focus.lock().await.session_id.clone();
        if let Err(e) = self
            .wire
            .call(Method::DELETE, &format!("/session/{old_session}"), None)
            .await
        {
            warn!(session = %old_session, "Failed to delete old session: {}", e);
        }

        let (session_id, handle) = Self::start(&self.wire, &self.options).await?;
        info!(old = %old_session, new = %session_id, "WebDriver session relaunched");
        {
            let mut focus = self.focus.lock().await;
            focus.session_id = session_id;
            focus.active = Some(handle.clone());
        }
        Ok(self.page_for(handle).await)
    }

    async fn shutdown(&self) -> Result<()> {
        let session_id = self.focus.lock().await.session_id.clone();
        self.wire
            .call(Method::DELETE, &format!("/session/{session_id}"), None)
            .await?;
        Ok(())
    }
}

pub struct WebDriverPage {
    wire: Arc<Wire>,
    focus: Arc<Mutex<Focus>>,
    session_id: String,
    handle: String,
    id: String,
}

impl WebDriverPage {
    /// Switches the session to this page's window (if needed) and issues one command.
    async fn command(&self, method: Method, suffix: &str, body: Option<Value>) -> Result<Value> {
        let mut focus = self.focus.lock().await;
        if focus.session_id != self.session_id {
            return Err(ScanError::SessionDead(format!(
                "{} belongs to a session that was relaunched",
                self.id
            )));
        }
        if focus.active.as_deref() != Some(self.handle.as_str()) {
            self.wire
                .call(
                    Method::POST,
                    &format!("/session/{}/window", self.session_id),
                    Some(json!({ "handle": self.handle })),
                )
                .await?;
            focus.active = Some(self.handle.clone());
        }
        self.wire
            .call(
                method,
                &format!("/session/{}{}", self.session_id, suffix),
                body,
            )
            .await
    }

    async fn perform(&self, actions: Value) -> Result<()> {
        self.command(Method::POST, "/actions", Some(json!({ "actions": actions })))
            .await?;
        Ok(())
    }

    async fn find(&self, css: &str) -> Result<String> {
        let found = self
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": css })),
            )
            .await
            .map_err(|e| match e {
                ScanError::WebDriver { error, .. } if error == "no such element" => {
                    ScanError::ElementNotFound(css.to_string())
                }
                other => other,
            })?;
        found
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ScanError::ParseError(format!("element reference missing for {css}")))
    }
}

fn pointer_actions(at: Point, click: bool) -> Value {
    let mut steps = vec![json!({
        "type": "pointerMove",
        "duration": 0,
        "origin": "viewport",
        "x": at.x.round() as i64,
        "y": at.y.round() as i64,
    })];
    if click {
        steps.push(json!({ "type": "pointerDown", "button": 0 }));
        steps.push(json!({ "type": "pointerUp", "button": 0 }));
    }
    json!([{
        "type": "pointer",
        "id": "mouse",
        "parameters": { "pointerType": "mouse" },
        "actions": steps,
    }])
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        url::Url::parse(url).map_err(|e| ScanError::InvalidUrl(format!("{url}: {e}")))?;
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let value = self.command(Method::GET, "/url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn pointer_move(&self, at: Point) -> Result<()> {
        self.perform(pointer_actions(at, false)).await
    }

    async fn click_at(&self, at: Point) -> Result<()> {
        self.perform(pointer_actions(at, true)).await
    }

    async fn scroll_wheel(&self, at: Point, delta_y: f64) -> Result<()> {
        self.perform(json!([{
            "type": "wheel",
            "id": "wheel",
            "actions": [{
                "type": "scroll",
                "origin": "viewport",
                "x": at.x.round() as i64,
                "y": at.y.round() as i64,
                "deltaX": 0,
                "deltaY": delta_y.round() as i64,
                "duration": 0,
            }],
        }]))
        .await
    }

    async fn type_into(&self, css: &str, text: &str, submit: bool) -> Result<()> {
        let element = self.find(css).await?;
        self.command(Method::POST, &format!("/element/{element}/clear"), None)
            .await?;
        let mut keys = text.to_string();
        if submit {
            keys.push_str(ENTER_KEY);
        }
        self.command(
            Method::POST,
            &format!("/element/{element}/value"),
            Some(json!({ "text": keys })),
        )
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.command(Method::DELETE, "/window", None).await?;
        let mut focus = self.focus.lock().await;
        if focus.active.as_deref() == Some(self.handle.as_str()) {
            focus.active = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "s1", "capabilities": {} }
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/window"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "w1" })))
            .mount(server)
            .await;
    }

    fn options(server: &MockServer) -> WebDriverOptions {
        WebDriverOptions {
            endpoint: server.uri(),
            ..WebDriverOptions::default()
        }
    }

    #[tokio::test]
    async fn test_connect_and_navigate() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .and(body_partial_json(json!({ "url": "https://listings.test/ny" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let (_session, page) = WebDriverSession::connect(options(&server)).await.unwrap();
        page.navigate("https://listings.test/ny").await.unwrap();
    }

    #[tokio::test]
    async fn test_evaluate_returns_value() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "value": { "count": 12 } })),
            )
            .mount(&server)
            .await;

        let (_session, page) = WebDriverSession::connect(options(&server)).await.unwrap();
        let value = page.evaluate("return {count: 12};", vec![]).await.unwrap();

        assert_eq!(value["count"], 12);
    }

    #[tokio::test]
    async fn test_error_body_maps_to_webdriver_error() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "no such window", "message": "window closed" }
            })))
            .mount(&server)
            .await;

        let (_session, page) = WebDriverSession::connect(options(&server)).await.unwrap();
        let err = page.evaluate("return 1;", vec![]).await.unwrap_err();

        assert!(err.is_session_dead(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_hung_page_times_out_as_session_dead() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "value": "complete" }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let (_session, page) = WebDriverSession::connect(WebDriverOptions {
            command_timeout: Duration::from_millis(200),
            ..options(&server)
        })
        .await
        .unwrap();
        let err = page.evaluate("return document.readyState;", vec![]).await.unwrap_err();

        assert!(matches!(err, ScanError::HttpError(_)));
        assert!(err.is_session_dead(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_new_page_switches_window_before_command() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/window/new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "handle": "w2", "type": "tab" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/window"))
            .and(body_partial_json(json!({ "handle": "w2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/url"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "value": "about:blank" })),
            )
            .mount(&server)
            .await;

        let (session, _first) = WebDriverSession::connect(options(&server)).await.unwrap();
        let second = session.new_page().await.unwrap();

        assert_eq!(second.current_url().await.unwrap(), "about:blank");
        // Second command on the same page must not switch again.
        assert_eq!(second.current_url().await.unwrap(), "about:blank");
    }

    #[tokio::test]
    async fn test_missing_element_maps_to_element_not_found() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "no such element", "message": "none" }
            })))
            .mount(&server)
            .await;

        let (_session, page) = WebDriverSession::connect(options(&server)).await.unwrap();
        let err = page
            .type_into("input.search", "Albany", true)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::ElementNotFound(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_pointer_click_actions_shape() {
        let actions = pointer_actions(Point::new(100.4, 199.6), true);
        let steps = actions[0]["actions"].as_array().unwrap();

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0]["x"], 100);
        assert_eq!(steps[0]["y"], 200);
        assert_eq!(steps[1]["type"], "pointerDown");
    }
}
