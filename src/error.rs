use thiserror::Error;

pub type BotResult<T> = Result<T, BotError>;

/// 框架核心错误类型
///
/// 插件回调返回 `RateLimited` / `PermissionDenied` 时，调度器会将其转换为
/// 对原始消息的用户提示；其余错误仅记录日志，不中断事件分发。
#[derive(Debug, Error)]
pub enum BotError {
    /// 触发了插件侧的频率限制
    #[error("操作过于频繁: {0}")]
    RateLimited(String),

    /// 发送者缺少所需权限规则
    #[error("权限不足: {0}")]
    PermissionDenied(String),

    /// 订阅目标非法 (例如缺少 robot id)，属于编程错误，快速失败
    #[error("非法订阅目标: {0}")]
    InvalidTarget(String),

    /// 订阅文件内容错误
    #[error("订阅配置错误: {0}")]
    Subscription(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BotError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
