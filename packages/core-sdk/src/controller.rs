use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::llm::RelayTransport;
use crate::models::RelayReply;
use crate::telemetry;
use crate::workflow::{update, CallFailure, Command, Msg, WorkflowState};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/**
 * \brief 当前进行中调用的取消令牌，可克隆后交给信号处理等外部任务。
 */
#[derive(Default, Clone)]
pub struct CancelHandle {
    inner: Arc<Mutex<Option<CancellationToken>>>,
}

impl CancelHandle {
    fn register(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(token.clone());
        }
        token
    }

    fn remove(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.take();
        }
    }

    /**
     * \brief 取消进行中的调用；没有调用时返回 false。
     */
    pub fn cancel(&self) -> bool {
        let token = self.inner.lock().ok().and_then(|mut g| g.take());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/**
 * \brief 驱动状态机：执行 `update` 产生的调用，并把结果回送给状态机。
 */
pub struct Controller<T: RelayTransport> {
    state: WorkflowState,
    transport: T,
    timeout: Duration,
    cancel: CancelHandle,
}

impl<T: RelayTransport> Controller<T> {
    pub fn new(state: WorkflowState, transport: T) -> Self {
        Self {
            state,
            transport,
            timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /**
     * \brief 处理一条消息；链式调用（如文档解析后自动提取症状）依次串行执行。
     */
    pub async fn dispatch(&mut self, msg: Msg) {
        let mut next = update(&mut self.state, msg);
        while let Some(command) = next {
            let outcome = self.execute(&command).await;
            next = update(
                &mut self.state,
                Msg::RelayCompleted {
                    kind: command.kind,
                    outcome,
                },
            );
        }
    }

    async fn execute(&self, command: &Command) -> Result<RelayReply, CallFailure> {
        let label = command.kind.label();
        telemetry::log_event(
            "controller.call",
            &format!(
                "kind={} msgs={} model={}",
                label,
                command.request.messages.len(),
                command.request.model.as_deref().unwrap_or("default")
            ),
        );
        let token = self.cancel.register();
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(CallFailure::Cancelled),
            res = tokio::time::timeout(self.timeout, self.transport.send(&command.request)) => {
                match res {
                    Ok(inner) => inner,
                    Err(_) => Err(CallFailure::TimedOut(self.timeout.as_secs())),
                }
            }
        };
        self.cancel.remove();
        if let Err(e) = &outcome {
            telemetry::log_error("controller.call", &format!("kind={} error={}", label, e));
        }
        outcome
    }
}
