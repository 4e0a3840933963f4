//! Request state for screens.
//!
//! Every controller owns a generation counter. Starting a request bumps it;
//! a response may only write state if its generation is still current and
//! the controller has not been unmounted. The check and the write happen
//! under one lock, so a slow response can never overwrite a newer one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::api::{ApiClient, ApiRequest};
use crate::scope::{ScopeToken, ScreenScope};
use crate::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FetchStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// What a screen renders. Never holds both data and an error.
///
/// Loading and idle states hold neither.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchState<T> {
    status: FetchStatus,
    data: Option<T>,
    error: Option<AppError>,
}

impl<T> FetchState<T> {
    pub fn idle() -> Self {
        Self {
            status: FetchStatus::Idle,
            data: None,
            error: None,
        }
    }

    pub fn loading() -> Self {
        Self {
            status: FetchStatus::Loading,
            data: None,
            error: None,
        }
    }

    pub fn success(data: T) -> Self {
        Self {
            status: FetchStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: AppError) -> Self {
        Self {
            status: FetchStatus::Error,
            data: None,
            error: Some(error),
        }
    }

    pub fn status(&self) -> FetchStatus {
        self.status
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn error(&self) -> Option<&AppError> {
        self.error.as_ref()
    }

    /// Text for the error banner; differs between "no connection" and "server said no".
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(AppError::user_facing_message)
    }

    pub fn is_loading(&self) -> bool {
        self.status == FetchStatus::Loading
    }
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

/// What happened to one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The result (success or error) was written to state.
    Committed,
    /// A newer call started first; the result was dropped.
    Superseded,
    /// The controller was unmounted; the result was dropped.
    Cancelled,
    /// Nothing was sent.
    Skipped,
}

/// One slice of a list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Offset of the most recent batch.
    pub offset: u32,
    pub limit: u32,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Appends when `request.append` and a page exists, otherwise replaces.
    pub fn merge(previous: Option<Self>, batch: Vec<T>, request: PageRequest) -> Self {
        let has_more = u32::try_from(batch.len()).is_ok_and(|len| len == request.limit);

        let items = match previous {
            Some(mut page) if request.append => {
                page.items.extend(batch);
                page.items
            }
            _ => batch,
        };

        Self {
            items,
            offset: request.offset,
            limit: request.limit,
            has_more,
        }
    }

    pub fn next_request(&self) -> PageRequest {
        PageRequest {
            limit: self.limit,
            offset: self.offset.saturating_add(self.limit),
            append: true,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    limit: u32,
    offset: u32,
    append: bool,
}

impl PageRequest {
    pub fn new(limit: u32, offset: u32, append: bool) -> AppResult<Self> {
        if limit == 0 {
            return Err(AppError::new(
                ErrorKind::Validation,
                "Page limit must be greater than 0",
            ));
        }
        Ok(Self {
            limit,
            offset,
            append,
        })
    }

    pub fn first(limit: u32) -> AppResult<Self> {
        Self::new(limit, 0, false)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn append(&self) -> bool {
        self.append
    }

    fn restarted(self) -> Self {
        Self {
            offset: 0,
            append: false,
            ..self
        }
    }
}

struct Tracker<S, L> {
    generation: u64,
    in_flight: bool,
    /// Last successful value; survives errors so a later append has something to extend.
    committed: Option<S>,
    last: Option<L>,
}

struct Core<S, L> {
    api: ApiClient,
    scope: ScreenScope,
    parent: Option<ScopeToken>,
    tracker: Mutex<Tracker<S, L>>,
    state: watch::Sender<FetchState<S>>,
}

impl<S: Clone, L> Core<S, L> {
    fn new(api: ApiClient, parent: Option<ScopeToken>) -> Self {
        Self {
            api,
            scope: ScreenScope::new(),
            parent,
            tracker: Mutex::new(Tracker {
                generation: 0,
                in_flight: false,
                committed: None,
                last: None,
            }),
            state: watch::Sender::new(FetchState::idle()),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, Tracker<S, L>> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_unmounted(&self) -> bool {
        self.scope.is_cancelled() || self.parent.as_ref().is_some_and(ScopeToken::is_cancelled)
    }

    async fn cancelled(&self) {
        let own = self.scope.token();
        match &self.parent {
            Some(parent) => {
                tokio::select! {
                    () = own.cancelled() => {}
                    () = parent.cancelled() => {}
                }
            }
            None => own.cancelled().await,
        }
    }

    /// Starts a new generation if `prepare` agrees, and moves state to loading.
    fn begin<X>(
        &self,
        prepare: impl FnOnce(&mut Tracker<S, L>) -> Option<X>,
    ) -> Result<(u64, X), FetchOutcome> {
        let mut tracker = self.tracker();
        if self.is_unmounted() {
            return Err(FetchOutcome::Cancelled);
        }

        let Some(prepared) = prepare(&mut tracker) else {
            return Err(FetchOutcome::Skipped);
        };

        tracker.generation += 1;
        tracker.in_flight = true;
        self.state.send_replace(FetchState::loading());
        Ok((tracker.generation, prepared))
    }

    async fn send<R: DeserializeOwned>(&self, request: &ApiRequest<R>) -> Option<AppResult<R>> {
        tokio::select! {
            biased;
            () = self.cancelled() => None,
            result = self.api.send(request) => Some(result),
        }
    }

    fn settle<R>(
        &self,
        generation: u64,
        result: AppResult<R>,
        merge: impl FnOnce(Option<S>, R) -> S,
    ) -> FetchOutcome {
        let mut tracker = self.tracker();
        if self.is_unmounted() {
            debug!(generation, "controller unmounted, discarding result");
            return FetchOutcome::Cancelled;
        }
        if tracker.generation != generation {
            debug!(generation, current = tracker.generation, "stale result discarded");
            return FetchOutcome::Superseded;
        }

        tracker.in_flight = false;
        let next = match result {
            Ok(value) => {
                let data = merge(tracker.committed.take(), value);
                tracker.committed = Some(data.clone());
                FetchState::success(data)
            }
            Err(error) => {
                debug!(error = %error, "request failed");
                FetchState::failure(error)
            }
        };
        self.state.send_replace(next);
        FetchOutcome::Committed
    }

    /// Commits an error without sending anything. Supersedes whatever is in flight.
    fn fail(&self, error: AppError) -> FetchOutcome {
        let mut tracker = self.tracker();
        if self.is_unmounted() {
            return FetchOutcome::Cancelled;
        }
        tracker.generation += 1;
        tracker.in_flight = false;
        self.state.send_replace(FetchState::failure(error));
        FetchOutcome::Committed
    }

    async fn run<R: DeserializeOwned>(
        &self,
        generation: u64,
        request: &ApiRequest<R>,
        merge: impl FnOnce(Option<S>, R) -> S,
    ) -> FetchOutcome {
        match self.send(request).await {
            Some(result) => self.settle(generation, result, merge),
            None => {
                debug!(generation, "request abandoned on unmount");
                FetchOutcome::Cancelled
            }
        }
    }
}

/// Loads one value for a screen.
pub struct FetchController<T> {
    core: Arc<Core<T, ApiRequest<T>>>,
}

impl<T> Clone for FetchController<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> std::fmt::Debug for FetchController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchController")
            .field("status", &self.core.state.borrow().status)
            .finish_non_exhaustive()
    }
}

impl<T> FetchController<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(api: ApiClient) -> Self {
        Self {
            core: Arc::new(Core::new(api, None)),
        }
    }

    /// Also stops when the screen's scope is cancelled.
    pub fn with_scope(api: ApiClient, scope: ScopeToken) -> Self {
        Self {
            core: Arc::new(Core::new(api, Some(scope))),
        }
    }

    #[instrument(skip_all, fields(path = %request.path()))]
    pub async fn fetch(&self, request: ApiRequest<T>) -> FetchOutcome {
        let generation = match self.core.begin(|tracker| {
            tracker.last = Some(request.clone());
            Some(())
        }) {
            Ok((generation, ())) => generation,
            Err(outcome) => return outcome,
        };

        self.core
            .run(generation, &request, |_, value| value)
            .await
    }

    /// Re-issues the last request. Skipped if nothing was fetched yet.
    pub async fn refresh(&self) -> FetchOutcome {
        let last = self.core.tracker().last.clone();
        match last {
            Some(request) => self.fetch(request).await,
            None => FetchOutcome::Skipped,
        }
    }

    pub fn state(&self) -> FetchState<T> {
        self.core.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.core.state.subscribe()
    }

    /// Drops every in-flight and future result.
    pub fn unmount(&self) {
        self.core.scope.cancel();
    }

    pub fn is_unmounted(&self) -> bool {
        self.core.is_unmounted()
    }
}

/// Loads a paginated list for a screen.
pub struct PageController<T> {
    core: Arc<Core<Page<T>, (ApiRequest<Vec<T>>, PageRequest)>>,
}

impl<T> Clone for PageController<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> std::fmt::Debug for PageController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageController")
            .field("status", &self.core.state.borrow().status)
            .finish_non_exhaustive()
    }
}

impl<T> PageController<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(api: ApiClient) -> Self {
        Self {
            core: Arc::new(Core::new(api, None)),
        }
    }

    pub fn with_scope(api: ApiClient, scope: ScopeToken) -> Self {
        Self {
            core: Arc::new(Core::new(api, Some(scope))),
        }
    }

    /// `request` is the list endpoint without paging; `limit` and `offset` are added here.
    #[instrument(
        skip_all,
        fields(path = %request.path(), offset = page.offset, limit = page.limit, append = page.append)
    )]
    pub async fn fetch_page(&self, request: ApiRequest<Vec<T>>, page: PageRequest) -> FetchOutcome {
        let generation = match self.core.begin(|tracker| {
            tracker.last = Some((request.clone(), page));
            Some(())
        }) {
            Ok((generation, ())) => generation,
            Err(outcome) => return outcome,
        };

        self.run(generation, &request, page).await
    }

    /// Fetches the first page using the configured page size.
    pub async fn fetch_first(&self, request: ApiRequest<Vec<T>>) -> FetchOutcome {
        match PageRequest::first(self.core.api.config().page_size) {
            Ok(page) => self.fetch_page(request, page).await,
            Err(error) => {
                debug!(%error, "configured page size unusable");
                self.core.fail(error)
            }
        }
    }

    /// Starts over from the first page.
    pub async fn refresh(&self) -> FetchOutcome {
        let last = self.core.tracker().last.clone();
        match last {
            Some((request, page)) => self.fetch_page(request, page.restarted()).await,
            None => FetchOutcome::Skipped,
        }
    }

    /// Fetches the next page and appends it.
    ///
    /// Skipped without touching state when there is no page yet, the last
    /// batch was short or another fetch is still running.
    #[instrument(skip(self))]
    pub async fn load_more(&self) -> FetchOutcome {
        let begun = self.core.begin(|tracker| {
            if tracker.in_flight {
                return None;
            }
            let next = tracker.committed.as_ref().filter(|page| page.has_more)?.next_request();
            let (request, _) = tracker.last.clone()?;
            tracker.last = Some((request.clone(), next));
            Some((request, next))
        });

        match begun {
            Ok((generation, (request, next))) => self.run(generation, &request, next).await,
            Err(outcome) => {
                debug!(?outcome, "load more skipped");
                outcome
            }
        }
    }

    async fn run(&self, generation: u64, request: &ApiRequest<Vec<T>>, page: PageRequest) -> FetchOutcome {
        let paged = request.clone().with_page(page.limit, page.offset);
        self.core
            .run(generation, &paged, |previous, batch| {
                Page::merge(previous, batch, page)
            })
            .await
    }

    pub fn state(&self) -> FetchState<Page<T>> {
        self.core.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState<Page<T>>> {
        self.core.state.subscribe()
    }

    pub fn has_more(&self) -> bool {
        self.core
            .tracker()
            .committed
            .as_ref()
            .is_some_and(|page| page.has_more)
    }

    pub fn unmount(&self) {
        self.core.scope.cancel();
    }

    pub fn is_unmounted(&self) -> bool {
        self.core.is_unmounted()
    }
}

/// Something a successful mutation should reload.
#[async_trait::async_trait]
pub trait Refreshable: Send + Sync {
    async fn refresh(&self) -> FetchOutcome;
}

#[async_trait::async_trait]
impl<T> Refreshable for FetchController<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn refresh(&self) -> FetchOutcome {
        FetchController::refresh(self).await
    }
}

#[async_trait::async_trait]
impl<T> Refreshable for PageController<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn refresh(&self) -> FetchOutcome {
        PageController::refresh(self).await
    }
}

/// A one-shot write (create ride, pay, rate) with its own state.
pub struct Mutation<T> {
    api: ApiClient,
    state: watch::Sender<FetchState<T>>,
}

impl<T> std::fmt::Debug for Mutation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("status", &self.state.borrow().status)
            .finish_non_exhaustive()
    }
}

impl<T> Mutation<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            state: watch::Sender::new(FetchState::idle()),
        }
    }

    /// Sends `request`; on success refreshes each of `targets` in order.
    #[instrument(skip_all, fields(path = %request.path()))]
    pub async fn submit(
        &self,
        request: &ApiRequest<T>,
        targets: &[&dyn Refreshable],
    ) -> AppResult<T> {
        let started = self.state.send_if_modified(|state| {
            if state.is_loading() {
                return false;
            }
            *state = FetchState::loading();
            true
        });
        if !started {
            return Err(AppError::new(
                ErrorKind::InvalidState,
                "This action is already in progress",
            ));
        }

        match self.api.send(request).await {
            Ok(value) => {
                self.state.send_replace(FetchState::success(value.clone()));
                for target in targets {
                    target.refresh().await;
                }
                Ok(value)
            }
            Err(error) => {
                self.state.send_replace(FetchState::failure(error.clone()));
                Err(error)
            }
        }
    }

    pub fn state(&self) -> FetchState<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.state.subscribe()
    }

    /// Back to idle, e.g. when a form is dismissed.
    pub fn reset(&self) {
        self.state.send_if_modified(|state| {
            if state.is_loading() {
                return false;
            }
            *state = FetchState::idle();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Payload;
    use crate::capabilities::testing::{scripted_capabilities, ScriptedTransport};
    use crate::capabilities::ValidatedUrl;
    use crate::config::ClientConfig;
    use crate::session::SessionStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn config() -> ClientConfig {
        ClientConfig::new(ValidatedUrl::new("https://api.example.com").unwrap())
    }

    fn client() -> (ApiClient, Arc<ScriptedTransport>) {
        client_with(config())
    }

    fn client_with(config: ClientConfig) -> (ApiClient, Arc<ScriptedTransport>) {
        let (caps, transport, _kv) = scripted_capabilities();
        let config = Arc::new(config);
        let session = SessionStore::new(caps.clone(), Arc::clone(&config));
        (ApiClient::new(caps, config, session), transport)
    }

    fn names() -> ApiRequest<Vec<String>> {
        ApiRequest::get("/api/names", Payload::Key("names")).public()
    }

    fn batch(range: std::ops::Range<u32>) -> serde_json::Value {
        let names: Vec<String> = range.map(|i| format!("n{i}")).collect();
        json!({"success": true, "names": names})
    }

    #[tokio::test]
    async fn test_fetch_success_and_error_states() {
        let (api, transport) = client();
        let controller = FetchController::new(api);
        assert_eq!(controller.state().status(), FetchStatus::Idle);

        transport.push_json(200, batch(0..2));
        assert_eq!(controller.fetch(names()).await, FetchOutcome::Committed);
        let state = controller.state();
        assert_eq!(state.status(), FetchStatus::Success);
        assert_eq!(state.data().unwrap().len(), 2);
        assert!(state.error().is_none());

        transport.push_json(500, json!({"success": false, "message": "Server exploded"}));
        assert_eq!(controller.refresh().await, FetchOutcome::Committed);
        let state = controller.state();
        assert_eq!(state.status(), FetchStatus::Error);
        assert!(state.data().is_none());
        assert_eq!(state.error().unwrap().message, "Server exploded");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_connectivity_and_server_errors_read_differently() {
        let (api, transport) = client();
        let controller = FetchController::new(api);

        transport.push_connection_error();
        controller.fetch(names()).await;
        let offline = controller.state();
        assert!(offline.error().unwrap().is_connectivity());

        transport.push_json(503, json!({"success": false, "message": "Maintenance"}));
        controller.fetch(names()).await;
        let server = controller.state();
        assert!(!server.error().unwrap().is_connectivity());

        assert_ne!(offline.error_message(), server.error_message());
    }

    #[tokio::test]
    async fn test_malformed_payload_lands_in_error() {
        let (api, transport) = client();
        let controller = FetchController::new(api);

        transport.push_json(200, json!({"success": true, "names": "not a list"}));
        controller.fetch(names()).await;
        assert_eq!(
            controller.state().error().unwrap().kind,
            ErrorKind::Deserialization
        );
    }

    #[tokio::test]
    async fn test_older_response_never_overwrites_newer() {
        let (api, transport) = client();
        let controller = FetchController::new(api);

        let slow = transport.push_gated();
        let fast = transport.push_gated();

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.fetch(names()).await }
        });
        transport.wait_for_calls(1).await;

        let second = tokio::spawn({
            let controller = controller.clone();
            async move { controller.fetch(names()).await }
        });
        transport.wait_for_calls(2).await;

        fast.respond_json(200, json!({"success": true, "names": ["b"]}));
        assert_eq!(second.await.unwrap(), FetchOutcome::Committed);

        slow.respond_json(200, json!({"success": true, "names": ["a"]}));
        assert_eq!(first.await.unwrap(), FetchOutcome::Superseded);

        assert_eq!(controller.state().data().unwrap(), &vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_loading_state_holds_no_data() {
        let (api, transport) = client();
        let controller = FetchController::new(api);

        transport.push_json(200, batch(0..2));
        controller.fetch(names()).await;
        assert!(controller.state().data().is_some());

        let gate = transport.push_gated();
        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.refresh().await }
        });
        transport.wait_for_calls(2).await;

        let loading = controller.state();
        assert!(loading.is_loading());
        assert!(loading.data().is_none());
        assert!(loading.error().is_none());

        gate.respond_json(200, batch(0..3));
        assert_eq!(pending.await.unwrap(), FetchOutcome::Committed);
        assert_eq!(controller.state().data().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_signed_out_fetch_fails_without_sending() {
        let (api, transport) = client();
        let controller = FetchController::new(api);

        let request = ApiRequest::<Vec<String>>::get("/api/names", Payload::Key("names"));
        assert_eq!(controller.fetch(request).await, FetchOutcome::Committed);

        let state = controller.state();
        assert_eq!(state.status(), FetchStatus::Error);
        assert_eq!(state.error().unwrap().kind, ErrorKind::Authentication);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unmount_discards_in_flight_result() {
        let (api, transport) = client();
        let controller = FetchController::new(api);
        let gate = transport.push_gated();

        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.fetch(names()).await }
        });
        transport.wait_for_calls(1).await;
        assert!(controller.state().is_loading());

        controller.unmount();
        assert_eq!(pending.await.unwrap(), FetchOutcome::Cancelled);
        gate.respond_json(200, batch(0..3));

        assert!(controller.state().is_loading());
        assert!(controller.state().data().is_none());

        assert_eq!(controller.fetch(names()).await, FetchOutcome::Cancelled);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_scope_cancellation_stops_controller() {
        let (api, transport) = client();
        let scope = ScreenScope::new();
        let controller = FetchController::<Vec<String>>::with_scope(api, scope.token());

        drop(scope);
        assert!(controller.is_unmounted());
        assert_eq!(controller.fetch(names()).await, FetchOutcome::Cancelled);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_without_history_is_skipped() {
        let (api, transport) = client();
        let controller = FetchController::<Vec<String>>::new(api);
        assert_eq!(controller.refresh().await, FetchOutcome::Skipped);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_full_page_has_more_and_short_page_does_not() {
        let (api, transport) = client();
        let controller = PageController::new(api);

        transport.push_json(200, batch(0..10));
        controller
            .fetch_page(names(), PageRequest::first(10).unwrap())
            .await;
        assert!(controller.state().data().unwrap().has_more);

        transport.push_json(200, batch(0..7));
        controller
            .fetch_page(names(), PageRequest::first(10).unwrap())
            .await;
        let page = controller.state().into_data().unwrap();
        assert!(!page.has_more);
        assert_eq!(page.len(), 7);
    }

    #[tokio::test]
    async fn test_load_more_appends_next_offset() {
        let (api, transport) = client();
        let controller = PageController::new(api);

        transport.push_json(200, batch(0..10));
        controller
            .fetch_page(names(), PageRequest::first(10).unwrap())
            .await;

        transport.push_json(200, batch(10..14));
        assert_eq!(controller.load_more().await, FetchOutcome::Committed);

        let page = controller.state().into_data().unwrap();
        assert_eq!(page.len(), 14);
        assert_eq!(page.items[0], "n0");
        assert_eq!(page.items[13], "n13");
        assert_eq!(page.offset, 10);
        assert!(!page.has_more);

        let sent = transport.last_request().unwrap();
        assert!(sent.url().as_str().ends_with("limit=10&offset=10"));
    }

    #[tokio::test]
    async fn test_fetch_first_uses_configured_page_size() {
        let (api, transport) = client_with(ClientConfig {
            page_size: 25,
            ..config()
        });
        let controller = PageController::new(api);

        transport.push_json(200, batch(0..25));
        assert_eq!(controller.fetch_first(names()).await, FetchOutcome::Committed);
        assert!(controller.has_more());
        let sent = transport.last_request().unwrap();
        assert!(sent.url().as_str().ends_with("limit=25&offset=0"));

        transport.push_json(200, batch(25..30));
        controller.load_more().await;
        let sent = transport.last_request().unwrap();
        assert!(sent.url().as_str().ends_with("limit=25&offset=25"));
        assert_eq!(controller.state().data().unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_fetch_first_with_zero_page_size_fails_without_sending() {
        let (api, transport) = client_with(ClientConfig {
            page_size: 0,
            ..config()
        });
        let controller = PageController::new(api);

        assert_eq!(controller.fetch_first(names()).await, FetchOutcome::Committed);
        assert_eq!(controller.state().status(), FetchStatus::Error);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_load_more_without_more_is_a_no_op() {
        let (api, transport) = client();
        let controller = PageController::new(api);

        transport.push_json(200, batch(0..7));
        controller
            .fetch_page(names(), PageRequest::first(10).unwrap())
            .await;
        let before = controller.state();
        let calls = transport.call_count();

        assert_eq!(controller.load_more().await, FetchOutcome::Skipped);
        assert_eq!(transport.call_count(), calls);
        assert_eq!(controller.state(), before);
    }

    #[tokio::test]
    async fn test_load_more_before_first_page_is_a_no_op() {
        let (api, transport) = client();
        let controller = PageController::<String>::new(api);

        assert_eq!(controller.load_more().await, FetchOutcome::Skipped);
        assert_eq!(controller.state().status(), FetchStatus::Idle);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_load_more_while_loading_is_a_no_op() {
        let (api, transport) = client();
        let controller = PageController::new(api);

        transport.push_json(200, batch(0..10));
        controller
            .fetch_page(names(), PageRequest::first(10).unwrap())
            .await;

        let gate = transport.push_gated();
        let more = tokio::spawn({
            let controller = controller.clone();
            async move { controller.load_more().await }
        });
        transport.wait_for_calls(2).await;

        assert_eq!(controller.load_more().await, FetchOutcome::Skipped);
        assert_eq!(transport.call_count(), 2);

        gate.respond_json(200, batch(10..20));
        assert_eq!(more.await.unwrap(), FetchOutcome::Committed);
        assert_eq!(controller.state().data().unwrap().len(), 20);
        assert!(controller.has_more());
    }

    #[tokio::test]
    async fn test_refresh_restarts_from_first_page() {
        let (api, transport) = client();
        let controller = PageController::new(api);

        transport.push_json(200, batch(0..10));
        controller
            .fetch_page(names(), PageRequest::first(10).unwrap())
            .await;
        transport.push_json(200, batch(10..20));
        controller.load_more().await;

        transport.push_json(200, batch(0..3));
        assert_eq!(controller.refresh().await, FetchOutcome::Committed);

        let page = controller.state().into_data().unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page.offset, 0);
        assert!(transport
            .last_request()
            .unwrap()
            .url()
            .as_str()
            .ends_with("offset=0"));
    }

    #[tokio::test]
    async fn test_failed_load_more_keeps_page_for_retry() {
        let (api, transport) = client();
        let controller = PageController::new(api);

        transport.push_json(200, batch(0..10));
        controller
            .fetch_page(names(), PageRequest::first(10).unwrap())
            .await;

        transport.push_connection_error();
        controller.load_more().await;
        assert_eq!(controller.state().status(), FetchStatus::Error);
        assert!(controller.has_more());

        transport.push_json(200, batch(10..12));
        assert_eq!(controller.load_more().await, FetchOutcome::Committed);
        assert_eq!(controller.state().data().unwrap().len(), 12);
    }

    #[test]
    fn test_page_request_rejects_zero_limit() {
        assert!(PageRequest::new(0, 0, false).is_err());
        assert!(PageRequest::first(1).is_ok());
    }

    #[tokio::test]
    async fn test_mutation_refreshes_targets_on_success() {
        let (api, transport) = client();
        let list = FetchController::new(api.clone());
        let mutation: Mutation<crate::model::Acknowledgement> = Mutation::new(api);

        transport.push_json(200, batch(0..1));
        list.fetch(names()).await;

        transport.push_json(200, json!({"success": true, "message": "Ride started"}));
        transport.push_json(200, batch(0..2));
        let request = ApiRequest::post("/api/rides/r1/start", Payload::Root).public();
        let ack = mutation.submit(&request, &[&list]).await.unwrap();

        assert_eq!(ack.message.as_deref(), Some("Ride started"));
        assert_eq!(mutation.state().status(), FetchStatus::Success);
        assert_eq!(list.state().data().unwrap().len(), 2);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_mutation_skips_refresh() {
        let (api, transport) = client();
        let list = FetchController::new(api.clone());
        let mutation: Mutation<crate::model::Acknowledgement> = Mutation::new(api);

        transport.push_json(200, batch(0..1));
        list.fetch(names()).await;

        transport.push_json(400, json!({"success": false, "message": "Ride is full"}));
        let request = ApiRequest::post("/api/rides/r1/start", Payload::Root).public();
        let error = mutation.submit(&request, &[&list]).await.unwrap_err();

        assert_eq!(error.user_facing_message(), "Ride is full");
        assert_eq!(mutation.state().status(), FetchStatus::Error);
        assert_eq!(transport.call_count(), 2);

        mutation.reset();
        assert_eq!(mutation.state().status(), FetchStatus::Idle);
    }

    proptest! {
        #[test]
        fn prop_appending_preserves_order(
            limit in 1u32..20,
            batches in prop::collection::vec(0usize..25, 1..6),
        ) {
            let mut page: Option<Page<usize>> = None;
            let mut expected = Vec::new();
            let mut request = PageRequest::first(limit).unwrap();

            for size in &batches {
                let start = expected.len();
                let items: Vec<usize> = (start..start + size).collect();
                expected.extend(items.iter().copied());

                let merged = Page::merge(page.take(), items, request);
                prop_assert_eq!(merged.has_more, *size == limit as usize);
                request = merged.next_request();
                page = Some(merged);
            }

            let page = page.unwrap();
            prop_assert_eq!(page.items, expected);
        }

        #[test]
        fn prop_replacing_drops_previous_items(limit in 1u32..20, first in 0usize..25, second in 0usize..25) {
            let request = PageRequest::first(limit).unwrap();
            let page = Page::merge(None, vec![0u8; first], request);
            let page = Page::merge(Some(page), vec![1u8; second], request);
            prop_assert_eq!(page.len(), second);
            prop_assert!(page.items.iter().all(|item| *item == 1));
        }
    }
}
