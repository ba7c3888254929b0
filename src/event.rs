use crate::error::BotResult;
use crate::identity::{ChatIdentity, ChatType};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 默认监听优先级，数值越大越先执行
pub const DEFAULT_PRIORITY: i32 = 0;

/// 事件名
///
/// 固定事件集合用枚举变体表达；`command/<x>`、`raw/<robot>/<x>` 这类
/// 真正动态的命名空间携带字符串键，插件内部子事件走 `Custom`。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    /// 通用消息事件
    Message,
    /// 焦点消息：私聊，或群/频道内显式提及机器人的消息
    MessageFocused,
    MessagePrivate,
    MessageGroup,
    MessageChannel,
    /// `command/<指令名>`
    Command(String),
    /// `raw/message` 通用直通消息
    RawMessage,
    /// `raw/<robot_type>/message`
    RawTypedMessage(String),
    /// `raw/<robot_type>/<事件名>` 适配器直通事件
    RawEvent { robot_type: String, name: String },
    /// 插件内部自定义子事件 (仅用于 EventScope 本地分发)
    Custom(String),
}

impl EventName {
    pub fn command(name: impl Into<String>) -> Self {
        Self::Command(name.into())
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    /// 会话类型对应的分发阶段事件 (Raw 没有专属消息阶段)
    pub fn for_chat(chat_type: ChatType) -> Option<Self> {
        match chat_type {
            ChatType::Private => Some(Self::MessagePrivate),
            ChatType::Group => Some(Self::MessageGroup),
            ChatType::Channel => Some(Self::MessageChannel),
            ChatType::Raw => None,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventName::Message => write!(f, "message"),
            EventName::MessageFocused => write!(f, "message/focused"),
            EventName::MessagePrivate => write!(f, "message/private"),
            EventName::MessageGroup => write!(f, "message/group"),
            EventName::MessageChannel => write!(f, "message/channel"),
            EventName::Command(name) => write!(f, "command/{name}"),
            EventName::RawMessage => write!(f, "raw/message"),
            EventName::RawTypedMessage(robot) => write!(f, "raw/{robot}/message"),
            EventName::RawEvent { robot_type, name } => write!(f, "raw/{robot_type}/{name}"),
            EventName::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// 回复出口，由适配器实现
///
/// 显式传入回复目标，取代按字段形状猜测“能否回复”的做法。
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_text(&self, text: &str) -> BotResult<()>;
}

/// 入站消息，由适配器构造后交给 EventBus
#[derive(Clone)]
pub struct IncomingMessage {
    pub sender: ChatIdentity,
    /// 纯文本内容
    pub text: String,
    /// 群/频道内是否显式 @ 了机器人
    pub mentioned: bool,
    /// 发送者在会话内的角色 (如 "admin"、"owner")
    pub roles: Vec<String>,
    /// 回复出口；为 None 时权限/限流提示静默丢弃
    pub reply: Option<Arc<dyn ReplySink>>,
}

impl IncomingMessage {
    pub fn new(sender: ChatIdentity, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            mentioned: false,
            roles: Vec::new(),
            reply: None,
        }
    }

    pub fn mentioned(mut self, mentioned: bool) -> Self {
        self.mentioned = mentioned;
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_reply(mut self, reply: Arc<dyn ReplySink>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// 尝试回复原始消息；没有回复出口时静默忽略
    pub async fn try_reply(&self, text: &str) {
        if let Some(sink) = &self.reply {
            if let Err(e) = sink.send_text(text).await {
                crate::warn!(target: "EventBus", "回复发送失败: {}", e);
            }
        }
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("sender", &self.sender)
            .field("text", &self.text)
            .field("mentioned", &self.mentioned)
            .field("roles", &self.roles)
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

/// 分发元信息：存在 sender 时做订阅过滤，存在 user_rules 时做权限校验
#[derive(Debug, Clone, Default)]
pub struct EventMeta {
    pub sender: Option<ChatIdentity>,
    /// 发送者满足的权限规则集合 (`plugin/scope`)；None 表示不校验
    pub user_rules: Option<HashSet<String>>,
    /// 发送者的会话角色，用于订阅项的 allowed_roles 过滤
    pub roles: HashSet<String>,
}

impl EventMeta {
    pub fn from_sender(sender: ChatIdentity) -> Self {
        Self {
            sender: Some(sender),
            ..Default::default()
        }
    }
}

/// 事件负载
#[derive(Debug, Clone)]
pub struct EventPayload {
    /// 事件参数，指令事件为 `{"command": ..., "param": ...}`
    pub args: serde_json::Value,
    /// 触发事件的原始消息，同时充当回复目标
    pub message: Option<Arc<IncomingMessage>>,
}

impl EventPayload {
    pub fn empty() -> Self {
        Self {
            args: serde_json::Value::Null,
            message: None,
        }
    }

    pub fn with_args(args: serde_json::Value) -> Self {
        Self {
            args,
            message: None,
        }
    }

    pub fn with_message(message: Arc<IncomingMessage>) -> Self {
        Self {
            args: serde_json::Value::Null,
            message: Some(message),
        }
    }
}

/// 注入给监听器的 `resolved()` 信号
///
/// 监听器调用 `resolve()` 后，本次 emit 不再继续执行更低优先级的监听器。
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    flag: Arc<AtomicBool>,
}

impl Resolver {
    pub fn resolve(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_resolved(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// 传递给监听器回调的上下文
#[derive(Clone)]
pub struct EventContext {
    pub event: EventName,
    pub payload: Arc<EventPayload>,
    resolver: Resolver,
}

impl EventContext {
    pub(crate) fn new(event: EventName, payload: Arc<EventPayload>, resolver: Resolver) -> Self {
        Self {
            event,
            payload,
            resolver,
        }
    }

    /// 标记事件已被完整处理，停止后续监听器
    pub fn resolve(&self) {
        self.resolver.resolve();
    }

    pub fn message(&self) -> Option<&Arc<IncomingMessage>> {
        self.payload.message.as_ref()
    }

    /// 回复原始消息的便捷方法
    pub async fn reply(&self, text: &str) -> BotResult<()> {
        if let Some(msg) = self.message()
            && let Some(sink) = &msg.reply
        {
            return sink.send_text(text).await;
        }
        Ok(())
    }
}

/// 监听器回调类型
pub type Listener = Arc<dyn Fn(EventContext) -> BoxFuture<'static, BotResult<()>> + Send + Sync>;

/// 将异步闭包包装为监听器回调
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BotResult<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}
