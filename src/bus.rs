//! 事件总线：监听器/指令注册表与分发主循环
//!
//! 分发保证：同一次 emit 内监听器按优先级降序严格串行执行，
//! 每个回调被完整等待后才轮到下一个；`resolved()` 短路其余监听器。
//! 注册表变更在同步锁临界区内完成，排序走脏标记 + 读取时惰性整理。

use crate::collab::RoleProvider;
use crate::config::{AppConfig, CommandOverride};
use crate::error::BotError;
use crate::event::{
    EventContext, EventMeta, EventName, EventPayload, IncomingMessage, Listener, Resolver,
};
use crate::identity::{ChatIdentity, ChatType};
use crate::scope::{ScopeId, ScopePolicy};
use crate::subscription::{SubscribeItem, SubscriptionIndex};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// 指令注册信息
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInfo {
    /// 规范名，分发键 `command/<规范名>`
    pub command: String,
    /// 显示名 (帮助菜单用)
    pub name: String,
    pub aliases: Vec<String>,
    pub help: String,
}

impl CommandInfo {
    pub fn new(
        command: impl Into<String>,
        name: impl Into<String>,
        help: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            name: name.into(),
            aliases: Vec::new(),
            help: help.into(),
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }
}

struct CommandRegistration {
    info: CommandInfo,
    owner: ScopeId,
}

struct ListenerEntry {
    owner: ScopeId,
    policy: Arc<ScopePolicy>,
    priority: i32,
    callback: Listener,
}

#[derive(Default)]
struct ListenerBucket {
    entries: Vec<ListenerEntry>,
    sorted: bool,
}

impl ListenerBucket {
    /// 惰性排序：写入只置脏，首次读取时一次性稳定排序
    /// (同优先级维持注册顺序)
    fn ensure_sorted(&mut self) {
        if !self.sorted {
            self.entries.sort_by(|a, b| b.priority.cmp(&a.priority));
            self.sorted = true;
        }
    }
}

/// 分发快照条目，持锁期间克隆出来，循环中不再碰注册表
struct Candidate {
    owner: ScopeId,
    policy: Arc<ScopePolicy>,
    callback: Listener,
}

/// 事件总线
///
/// 每个应用实例持有一个，随应用构建与销毁，不做进程级全局状态。
pub struct EventBus {
    listeners: RwLock<HashMap<EventName, ListenerBucket>>,
    /// 指令键 (小写，含别名) → 注册信息
    commands: RwLock<HashMap<String, Arc<CommandRegistration>>>,
    subscriptions: Arc<SubscriptionIndex>,
    roles: Arc<dyn RoleProvider>,
    overrides: HashMap<String, CommandOverride>,
    /// 群/频道内是否要求 @ 机器人才尝试指令解析
    command_needs_focus: bool,
}

impl EventBus {
    pub fn new(
        subscriptions: Arc<SubscriptionIndex>,
        roles: Arc<dyn RoleProvider>,
        config: &AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(HashMap::new()),
            commands: RwLock::new(HashMap::new()),
            subscriptions,
            roles,
            overrides: config.command_overrides.clone(),
            command_needs_focus: config.command_needs_focus,
        })
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionIndex> {
        &self.subscriptions
    }

    // ================== 注册表维护 ==================

    pub fn on(
        &self,
        event: EventName,
        owner: ScopeId,
        policy: Arc<ScopePolicy>,
        priority: i32,
        callback: Listener,
    ) {
        let mut listeners = self.listeners.write().unwrap();
        let bucket = listeners.entry(event).or_default();
        bucket.entries.push(ListenerEntry {
            owner,
            policy,
            priority,
            callback,
        });
        bucket.sorted = false;
    }

    /// 注销单个监听器 (按归属作用域 + 回调指针)
    pub fn off_listener(&self, event: &EventName, owner: &ScopeId, callback: &Listener) {
        let mut listeners = self.listeners.write().unwrap();
        if let Some(bucket) = listeners.get_mut(event) {
            bucket
                .entries
                .retain(|e| !(e.owner == *owner && Arc::ptr_eq(&e.callback, callback)));
        }
    }

    /// 摘除作用域拥有的全部监听器与指令 (插件卸载/重载)
    pub fn off_scope(&self, owner: &ScopeId) {
        {
            let mut listeners = self.listeners.write().unwrap();
            for bucket in listeners.values_mut() {
                bucket.entries.retain(|e| e.owner != *owner);
            }
            listeners.retain(|_, bucket| !bucket.entries.is_empty());
        }
        self.commands
            .write()
            .unwrap()
            .retain(|_, reg| reg.owner != *owner);
    }

    /// 注册指令；别名展开成指向同一注册信息的额外键
    ///
    /// 外部覆写表 (按规范名重命名/改帮助/换别名) 在注册时应用。
    pub fn add_command(&self, mut info: CommandInfo, owner: &ScopeId) {
        if let Some(over) = self.overrides.get(&info.command) {
            if let Some(name) = &over.name {
                info.name = name.clone();
            }
            if let Some(help) = &over.help {
                info.help = help.clone();
            }
            if let Some(alias) = &over.alias {
                info.aliases = alias.clone();
            }
        }

        let reg = Arc::new(CommandRegistration {
            info: info.clone(),
            owner: owner.clone(),
        });
        let mut commands = self.commands.write().unwrap();
        let mut keys = vec![info.command.to_lowercase()];
        keys.extend(info.aliases.iter().map(|a| a.to_lowercase()));
        for key in keys {
            if let Some(old) = commands.insert(key.clone(), reg.clone())
                && old.info.command != reg.info.command
            {
                warn!(target: "EventBus", "指令键 [{}] 由 {} 改挂到 {}", key, old.owner, owner);
            }
        }
    }

    pub fn remove_command(&self, command: &str, owner: &ScopeId) {
        self.commands
            .write()
            .unwrap()
            .retain(|_, reg| !(reg.info.command == command && reg.owner == *owner));
    }

    /// 枚举已注册指令 (按规范名去重)
    pub fn commands(&self) -> Vec<CommandInfo> {
        let commands = self.commands.read().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for reg in commands.values() {
            if seen.insert(reg.info.command.clone()) {
                out.push(reg.info.clone());
            }
        }
        out
    }

    // ================== 分发 ==================

    /// 分发事件，返回是否被某个监听器 `resolved()`
    ///
    /// 未注册的事件名是静默空操作。meta 带 sender 时按订阅索引 + 作用域
    /// 策略过滤候选；带 user_rules 时先逐个校验权限规则，首个失败即中止
    /// 本次分发并回复缺失规则 (有回复目标时)。
    pub async fn emit(&self, event: &EventName, meta: &EventMeta, payload: EventPayload) -> bool {
        let mut candidates = self.snapshot(event);
        if candidates.is_empty() {
            return false;
        }

        if let Some(sender) = &meta.sender {
            let target = sender.subscribe_target();
            let items = self.subscriptions.get_subscribe_items(&target, true);
            let by_key: HashMap<String, &SubscribeItem> =
                items.iter().map(|i| (i.key(), i)).collect();
            candidates.retain(|c| Self::passes_subscription(c, sender, &by_key, &meta.roles));
            if candidates.is_empty() {
                return false;
            }
        }

        // 权限校验先于任何回调执行，整次分发要么全量放行要么中止
        if let Some(rules) = &meta.user_rules {
            for candidate in &candidates {
                let rule = candidate.owner.rule();
                if !rules.contains(&rule) {
                    warn!(
                        target: "EventBus",
                        "[{}] 缺少权限规则，事件 {} 中止分发", candidate.owner, event
                    );
                    if let Some(msg) = &payload.message {
                        msg.try_reply(&format!("权限不足，缺少规则: {rule}")).await;
                    }
                    return false;
                }
            }
        }

        let payload = Arc::new(payload);
        let resolver = Resolver::default();
        for candidate in candidates {
            let ctx = EventContext::new(event.clone(), payload.clone(), resolver.clone());
            match (candidate.callback)(ctx).await {
                Ok(()) => {}
                Err(e @ (BotError::RateLimited(_) | BotError::PermissionDenied(_))) => {
                    // 分类错误转成用户提示，分发继续
                    if let Some(msg) = &payload.message {
                        msg.try_reply(&e.to_string()).await;
                    }
                    debug!(target: "EventBus", "[{}] {}", candidate.owner, e);
                }
                Err(e) => {
                    error!(
                        target: "EventBus",
                        "[{}] 监听器执行失败 ({}): {}", candidate.owner, event, e
                    );
                }
            }
            if resolver.is_resolved() {
                return true;
            }
        }
        false
    }

    /// 入站消息的阶段化分发
    ///
    /// 发送者身份与权限规则集只计算一次。阶段顺序：指令 → 焦点消息 →
    /// 会话类型消息 → 通用消息，首个 resolve 的阶段终止流程。
    pub async fn emit_message(&self, message: IncomingMessage) -> bool {
        let sender = message.sender.clone();
        let user_rules = self.roles.user_rules(&sender).await;
        let roles: HashSet<String> = message.roles.iter().cloned().collect();
        let meta = EventMeta {
            sender: Some(sender.clone()),
            user_rules,
            roles,
        };
        let message = Arc::new(message);
        let focused = sender.chat_type == ChatType::Private || message.mentioned;

        let try_command = match sender.chat_type {
            ChatType::Private => true,
            ChatType::Group | ChatType::Channel => !self.command_needs_focus || message.mentioned,
            ChatType::Raw => false,
        };
        if try_command {
            let text = message.text.clone();
            if self.emit_command(&text, &meta, Some(message.clone())).await {
                return true;
            }
        }

        if focused
            && self
                .emit(
                    &EventName::MessageFocused,
                    &meta,
                    EventPayload::with_message(message.clone()),
                )
                .await
        {
            return true;
        }

        if let Some(stage) = EventName::for_chat(sender.chat_type)
            && self
                .emit(&stage, &meta, EventPayload::with_message(message.clone()))
                .await
        {
            return true;
        }

        self.emit(
            &EventName::Message,
            &meta,
            EventPayload::with_message(message),
        )
        .await
    }

    /// 指令文本解析与分发；未命中任何指令键返回 false (非错误)
    pub async fn emit_command(
        &self,
        text: &str,
        meta: &EventMeta,
        message: Option<Arc<IncomingMessage>>,
    ) -> bool {
        let Some((canonical, param)) = self.match_command(text) else {
            return false;
        };
        let payload = EventPayload {
            args: serde_json::json!({ "command": canonical, "param": param }),
            message,
        };
        self.emit(&EventName::Command(canonical), meta, payload).await
    }

    /// 指令匹配算法
    ///
    /// a. 文本含空格时先按首 token 精确查表；
    /// b. 否则 (或首 token 未注册) 扫描全部指令键取最长字面前缀，
    ///    等长键按字典序取最小，保证与哈希表遍历顺序无关；
    /// c. 均未命中返回 None。
    fn match_command(&self, text: &str) -> Option<(String, String)> {
        let commands = self.commands.read().unwrap();
        if commands.is_empty() || text.is_empty() {
            return None;
        }
        let lower = text.to_lowercase();

        if let Some(idx) = lower.find(' ') {
            let token = &lower[..idx];
            if let Some(reg) = commands.get(token) {
                return Some((reg.info.command.clone(), slice_after(text, idx + 1)));
            }
        }

        let mut keys: Vec<&String> = commands.keys().collect();
        keys.sort();
        let mut best: Option<&str> = None;
        for key in keys {
            if lower.starts_with(key.as_str()) && best.is_none_or(|b| key.len() > b.len()) {
                best = Some(key);
            }
        }
        let key = best?;
        let reg = &commands[key];
        Some((reg.info.command.clone(), slice_after(text, key.len())))
    }

    /// 适配器直通事件：meta 不带 sender，绕过订阅过滤
    pub async fn emit_raw_event(
        &self,
        robot_type: &str,
        name: &str,
        value: serde_json::Value,
    ) -> bool {
        let event = EventName::RawEvent {
            robot_type: robot_type.to_string(),
            name: name.to_string(),
        };
        self.emit(&event, &EventMeta::default(), EventPayload::with_args(value))
            .await
    }

    /// 适配器直通消息：计算发送者并做完整过滤，
    /// `raw/<robot_type>/message` 未 resolve 时回落到通用 `raw/message`
    pub async fn emit_raw_message(&self, message: IncomingMessage) -> bool {
        let sender = message.sender.clone();
        let user_rules = self.roles.user_rules(&sender).await;
        let roles: HashSet<String> = message.roles.iter().cloned().collect();
        let meta = EventMeta {
            sender: Some(sender.clone()),
            user_rules,
            roles,
        };
        let message = Arc::new(message);

        if self
            .emit(
                &EventName::RawTypedMessage(sender.robot_type.clone()),
                &meta,
                EventPayload::with_message(message.clone()),
            )
            .await
        {
            return true;
        }
        self.emit(
            &EventName::RawMessage,
            &meta,
            EventPayload::with_message(message),
        )
        .await
    }

    // ================== 内部工具 ==================

    /// 持锁整理并克隆该事件的监听器列表；循环执行期间不再持锁
    fn snapshot(&self, event: &EventName) -> Vec<Candidate> {
        let mut listeners = self.listeners.write().unwrap();
        let Some(bucket) = listeners.get_mut(event) else {
            return Vec::new();
        };
        bucket.ensure_sorted();
        bucket
            .entries
            .iter()
            .map(|e| Candidate {
                owner: e.owner.clone(),
                policy: e.policy.clone(),
                callback: e.callback.clone(),
            })
            .collect()
    }

    /// 订阅过滤：策略兼容 + (强制订阅 | 显式订阅项 | 自动订阅)
    ///
    /// 订阅项查找顺序：`插件:作用域` 精确键，其次 `插件:*` 通配键。
    /// disabled 的具体项会遮蔽上层同键 enabled 项 (索引合并已保证)。
    fn passes_subscription(
        candidate: &Candidate,
        sender: &ChatIdentity,
        items: &HashMap<String, &SubscribeItem>,
        roles: &HashSet<String>,
    ) -> bool {
        if !candidate.policy.allows(sender) {
            return false;
        }
        if candidate.policy.force_subscribe {
            return true;
        }
        let item = items
            .get(&candidate.owner.item_key())
            .or_else(|| items.get(&format!("{}:*", candidate.owner.plugin)));
        match item {
            Some(item) => {
                item.enabled
                    && (item.allowed_roles.is_empty()
                        || item.allowed_roles.iter().any(|r| roles.contains(r)))
            }
            None => candidate.policy.auto_subscribe,
        }
    }
}

/// 按小写折叠后文本里的字节偏移切出参数
///
/// 折叠可能改变单个字符的字节长度 (极少数非 ASCII 场景)，因此逐字符
/// 累计折叠后长度定位原文里的分界，返回值始终保留调用方的原始大小写。
fn slice_after(text: &str, lowered_idx: usize) -> String {
    let mut consumed = 0;
    for (pos, ch) in text.char_indices() {
        if consumed >= lowered_idx {
            return text[pos..].to_string();
        }
        consumed += ch.to_lowercase().map(char::len_utf8).sum::<usize>();
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::AllowAllRoles;
    use crate::event::listener;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_bus() -> Arc<EventBus> {
        EventBus::new(
            Arc::new(SubscriptionIndex::new()),
            Arc::new(AllowAllRoles),
            &AppConfig::default(),
        )
    }

    fn scope_id(plugin: &str) -> ScopeId {
        ScopeId::new(plugin, "main")
    }

    fn counting_listener(counter: Arc<AtomicUsize>) -> Listener {
        listener(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn unregistered_event_is_silent_noop() {
        let bus = test_bus();
        // P1: 零回调执行，返回 false
        let resolved = bus
            .emit(
                &EventName::custom("nothing"),
                &EventMeta::default(),
                EventPayload::empty(),
            )
            .await;
        assert!(!resolved);
    }

    #[tokio::test]
    async fn priority_order_is_independent_of_registration_order() {
        let bus = test_bus();
        let order = Arc::new(Mutex::new(Vec::new()));
        let policy = Arc::new(ScopePolicy::default());

        for (name, priority) in [("low", 10), ("high", 90), ("mid", 50)] {
            let order = order.clone();
            bus.on(
                EventName::Message,
                scope_id(name),
                policy.clone(),
                priority,
                listener(move |_ctx| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(name);
                        Ok(())
                    }
                }),
            );
        }

        bus.emit(
            &EventName::Message,
            &EventMeta::default(),
            EventPayload::empty(),
        )
        .await;
        // P2: 与注册顺序无关，按优先级降序
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn resolve_short_circuits_lower_priority() {
        let bus = test_bus();
        let order = Arc::new(Mutex::new(Vec::new()));
        let policy = Arc::new(ScopePolicy::default());

        let o = order.clone();
        bus.on(
            EventName::Message,
            scope_id("low"),
            policy.clone(),
            20,
            listener(move |_ctx| {
                let o = o.clone();
                async move {
                    o.lock().unwrap().push("low");
                    Ok(())
                }
            }),
        );
        let o = order.clone();
        bus.on(
            EventName::Message,
            scope_id("high"),
            policy,
            50,
            listener(move |ctx| {
                let o = o.clone();
                async move {
                    o.lock().unwrap().push("high");
                    ctx.resolve();
                    Ok(())
                }
            }),
        );

        let resolved = bus
            .emit(
                &EventName::Message,
                &EventMeta::default(),
                EventPayload::empty(),
            )
            .await;
        assert!(resolved);
        assert_eq!(*order.lock().unwrap(), vec!["high"]);
    }

    #[tokio::test]
    async fn listener_errors_are_isolated() {
        let bus = test_bus();
        let policy = Arc::new(ScopePolicy::default());
        let counter = Arc::new(AtomicUsize::new(0));

        bus.on(
            EventName::Message,
            scope_id("broken"),
            policy.clone(),
            50,
            listener(|_ctx| async { Err(BotError::other("炸了")) }),
        );
        bus.on(
            EventName::Message,
            scope_id("fine"),
            policy,
            10,
            counting_listener(counter.clone()),
        );

        bus.emit(
            &EventName::Message,
            &EventMeta::default(),
            EventPayload::empty(),
        )
        .await;
        // 错误被隔离，低优先级监听器照常执行
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn command_parsing_space_prefix_and_miss() {
        let bus = test_bus();
        let owner = scope_id("helper");
        bus.add_command(CommandInfo::new("help", "帮助", "查看帮助"), &owner);

        // P7
        assert_eq!(
            bus.match_command("help extra text"),
            Some(("help".to_string(), "extra text".to_string()))
        );
        assert_eq!(
            bus.match_command("helpme"),
            Some(("help".to_string(), "me".to_string()))
        );
        assert_eq!(bus.match_command("xyz"), None);
    }

    #[tokio::test]
    async fn command_longest_prefix_wins() {
        let bus = test_bus();
        let owner = scope_id("helper");
        bus.add_command(CommandInfo::new("he", "he", ""), &owner);
        bus.add_command(CommandInfo::new("help", "help", ""), &owner);
        bus.add_command(CommandInfo::new("hell", "hell", ""), &owner);

        // 多个键均为前缀时取最长
        assert_eq!(
            bus.match_command("helpx"),
            Some(("help".to_string(), "x".to_string()))
        );
        assert_eq!(
            bus.match_command("hellx"),
            Some(("hell".to_string(), "x".to_string()))
        );
        assert_eq!(
            bus.match_command("hex"),
            Some(("he".to_string(), "x".to_string()))
        );
    }

    #[tokio::test]
    async fn command_param_keeps_original_casing() {
        let bus = test_bus();
        let owner = scope_id("kite");
        bus.add_command(CommandInfo::new("kite", "Kite", ""), &owner);

        assert_eq!(
            bus.match_command("KITE Hello World"),
            Some(("kite".to_string(), "Hello World".to_string()))
        );
        // 开尔文符号折叠后字节数变化，参数仍取自原文
        assert_eq!(
            bus.match_command("\u{212A}ite Param"),
            Some(("kite".to_string(), "Param".to_string()))
        );
    }

    #[tokio::test]
    async fn off_listener_removes_only_matching_callback() {
        let bus = test_bus();
        let owner = scope_id("p");
        let policy = Arc::new(ScopePolicy::default());
        let kept = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        let keep_cb = counting_listener(kept.clone());
        let drop_cb = counting_listener(dropped.clone());
        bus.on(
            EventName::Message,
            owner.clone(),
            policy.clone(),
            0,
            keep_cb,
        );
        bus.on(EventName::Message, owner.clone(), policy, 0, drop_cb.clone());

        bus.off_listener(&EventName::Message, &owner, &drop_cb);
        bus.emit(
            &EventName::Message,
            &EventMeta::default(),
            EventPayload::empty(),
        )
        .await;
        // 按回调指针匹配，只摘掉目标监听器
        assert_eq!(kept.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_command_strips_alias_keys() {
        let bus = test_bus();
        let owner = scope_id("echo");
        bus.add_command(
            CommandInfo::new("echo", "回声", "").with_aliases(vec!["say".to_string()]),
            &owner,
        );

        // 归属不符时不移除
        bus.remove_command("echo", &scope_id("other"));
        assert!(bus.match_command("say hi").is_some());

        bus.remove_command("echo", &owner);
        assert_eq!(bus.match_command("echo hi"), None);
        assert_eq!(bus.match_command("say hi"), None);
        assert!(bus.commands().is_empty());
    }

    #[tokio::test]
    async fn command_alias_resolves_to_canonical() {
        let bus = test_bus();
        let owner = scope_id("echo");
        bus.add_command(
            CommandInfo::new("echo", "回声", "").with_aliases(vec!["say".to_string()]),
            &owner,
        );

        assert_eq!(
            bus.match_command("say hi"),
            Some(("echo".to_string(), "hi".to_string()))
        );
        // 大小写不敏感
        assert_eq!(
            bus.match_command("ECHO hi"),
            Some(("echo".to_string(), "hi".to_string()))
        );
    }

    #[tokio::test]
    async fn command_override_applied_at_registration() {
        let mut config = AppConfig::default();
        config.command_overrides.insert(
            "echo".to_string(),
            CommandOverride {
                name: Some("复读".to_string()),
                help: None,
                alias: Some(vec!["repeat".to_string()]),
            },
        );
        let bus = EventBus::new(
            Arc::new(SubscriptionIndex::new()),
            Arc::new(AllowAllRoles),
            &config,
        );
        let owner = scope_id("echo");
        bus.add_command(
            CommandInfo::new("echo", "回声", "").with_aliases(vec!["say".to_string()]),
            &owner,
        );

        // 覆写后原别名 say 不再生效，新别名 repeat 生效
        assert_eq!(bus.match_command("say hi"), None);
        assert_eq!(
            bus.match_command("repeat hi"),
            Some(("echo".to_string(), "hi".to_string()))
        );
        let infos = bus.commands();
        assert_eq!(infos[0].name, "复读");
    }

    #[tokio::test]
    async fn off_scope_removes_listeners_and_commands() {
        let bus = test_bus();
        let owner = scope_id("p");
        let counter = Arc::new(AtomicUsize::new(0));
        let policy = Arc::new(ScopePolicy::default());

        bus.on(
            EventName::Message,
            owner.clone(),
            policy,
            0,
            counting_listener(counter.clone()),
        );
        bus.add_command(CommandInfo::new("x", "x", ""), &owner);

        bus.off_scope(&owner);
        let resolved = bus
            .emit(
                &EventName::Message,
                &EventMeta::default(),
                EventPayload::empty(),
            )
            .await;
        assert!(!resolved);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(bus.match_command("x y"), None);
    }

    #[tokio::test]
    async fn subscription_filter_respects_policy_and_items() {
        let bus = test_bus();
        let policy_auto = Arc::new(ScopePolicy::auto());
        let mut no_group = ScopePolicy::auto();
        no_group.allow_group = false;
        let policy_no_group = Arc::new(no_group);
        let policy_plain = Arc::new(ScopePolicy::default());

        let hits = Arc::new(Mutex::new(Vec::new()));
        for (plugin, policy) in [
            ("auto", policy_auto),
            ("no_group", policy_no_group),
            ("plain", policy_plain),
        ] {
            let hits = hits.clone();
            bus.on(
                EventName::MessageGroup,
                scope_id(plugin),
                policy,
                0,
                listener(move |_ctx| {
                    let hits = hits.clone();
                    async move {
                        hits.lock().unwrap().push(plugin);
                        Ok(())
                    }
                }),
            );
        }

        let sender = ChatIdentity::group("qq", "r1", "u1", "g1");
        let meta = EventMeta::from_sender(sender);
        bus.emit(&EventName::MessageGroup, &meta, EventPayload::empty())
            .await;
        // auto_subscribe 放行；群聊被策略挡掉；无订阅且非 auto 不分发
        assert_eq!(*hits.lock().unwrap(), vec!["auto"]);
    }

    #[tokio::test]
    async fn explicit_disabled_item_blocks_auto_subscribe() {
        let bus = test_bus();
        bus.subscriptions()
            .add_subscribe(
                &crate::subscription::SubscribeTarget::robot("r1"),
                SubscribeItem::new("auto").disabled(),
                false,
            )
            .await
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(
            EventName::MessagePrivate,
            scope_id("auto"),
            Arc::new(ScopePolicy::auto()),
            0,
            counting_listener(counter.clone()),
        );

        let meta = EventMeta::from_sender(ChatIdentity::private("qq", "r1", "u1"));
        bus.emit(&EventName::MessagePrivate, &meta, EventPayload::empty())
            .await;
        // 显式 disabled 项覆盖 auto_subscribe 默认
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permission_failure_aborts_whole_dispatch() {
        let bus = test_bus();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(
            EventName::Message,
            scope_id("secret"),
            Arc::new(ScopePolicy::default()),
            0,
            counting_listener(counter.clone()),
        );

        let meta = EventMeta {
            sender: None,
            user_rules: Some(HashSet::from(["other/main".to_string()])),
            roles: HashSet::new(),
        };
        let resolved = bus
            .emit(&EventName::Message, &meta, EventPayload::empty())
            .await;
        assert!(!resolved);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
