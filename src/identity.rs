use crate::subscription::SubscribeTarget;
use serde::{Deserialize, Serialize};

/// 会话类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
    Channel,
    /// 适配器直通事件，不属于任何会话
    Raw,
}

/// 发送者标识，由适配器在投递事件时构造，作为调度过滤键
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatIdentity {
    #[serde(rename = "type")]
    pub chat_type: ChatType,

    /// 机器人账号 ID
    pub robot_id: String,

    /// 平台类型 (如 "qq"、"telegram")
    pub robot_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// 父级群组 (嵌套群场景)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_group_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl ChatIdentity {
    pub fn private(
        robot_type: impl Into<String>,
        robot_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            chat_type: ChatType::Private,
            robot_id: robot_id.into(),
            robot_type: robot_type.into(),
            user_id: Some(user_id.into()),
            group_id: None,
            root_group_id: None,
            channel_id: None,
        }
    }

    pub fn group(
        robot_type: impl Into<String>,
        robot_id: impl Into<String>,
        user_id: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            chat_type: ChatType::Group,
            robot_id: robot_id.into(),
            robot_type: robot_type.into(),
            user_id: Some(user_id.into()),
            group_id: Some(group_id.into()),
            root_group_id: None,
            channel_id: None,
        }
    }

    pub fn channel(
        robot_type: impl Into<String>,
        robot_id: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            chat_type: ChatType::Channel,
            robot_id: robot_id.into(),
            robot_type: robot_type.into(),
            user_id: Some(user_id.into()),
            group_id: None,
            root_group_id: None,
            channel_id: Some(channel_id.into()),
        }
    }

    pub fn raw(robot_type: impl Into<String>, robot_id: impl Into<String>) -> Self {
        Self {
            chat_type: ChatType::Raw,
            robot_id: robot_id.into(),
            robot_type: robot_type.into(),
            user_id: None,
            group_id: None,
            root_group_id: None,
            channel_id: None,
        }
    }

    pub fn with_root_group(mut self, root_group_id: impl Into<String>) -> Self {
        self.root_group_id = Some(root_group_id.into());
        self
    }

    /// 该发送者在订阅索引中对应的查询目标
    pub fn subscribe_target(&self) -> SubscribeTarget {
        match self.chat_type {
            ChatType::Private => SubscribeTarget::RobotUser {
                robot: self.robot_id.clone(),
            },
            ChatType::Group => match &self.group_id {
                Some(group) => SubscribeTarget::Group {
                    robot: self.robot_id.clone(),
                    group: group.clone(),
                    root_group: self.root_group_id.clone(),
                },
                None => SubscribeTarget::Robot {
                    robot: self.robot_id.clone(),
                },
            },
            ChatType::Channel => match &self.channel_id {
                Some(channel) => SubscribeTarget::Channel {
                    robot: self.robot_id.clone(),
                    channel: channel.clone(),
                },
                None => SubscribeTarget::Robot {
                    robot: self.robot_id.clone(),
                },
            },
            ChatType::Raw => SubscribeTarget::Robot {
                robot: self.robot_id.clone(),
            },
        }
    }
}
