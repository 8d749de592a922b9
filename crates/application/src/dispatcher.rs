//! 通知分发器
//!
//! 把 REST 层已经持久化好的通知尽力推给在线用户。分发器从不生产
//! 通知内容，也不负责离线投递：通知行的存在性由调用前的存储写入
//! 保证，这里只做"在线就推一把"。

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::error;

use domain::{GroupId, Notification, UserId};

use crate::hub::Hub;

#[derive(Clone)]
pub struct NotificationDispatcher {
    hub: Arc<Hub>,
}

impl NotificationDispatcher {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// 给单个用户推一条实时通知
    ///
    /// 用户不在线时立即返回 false，不算错误；入队失败时丢弃并记日志。
    pub async fn send_to_user(
        &self,
        user_id: UserId,
        notification: Notification,
        extra: Option<JsonValue>,
    ) -> bool {
        self.hub.push_notification(user_id, notification, extra).await
    }

    /// 给调用方给定的受众逐个推送，跳过 exclude
    ///
    /// 受众名单由调用方解析（群成员、聊天参与者等查询）。
    pub async fn broadcast_to_audience(
        &self,
        audience: &[UserId],
        notification: &Notification,
        exclude: Option<UserId>,
        extra: Option<JsonValue>,
    ) {
        for user_id in audience {
            if Some(*user_id) == exclude {
                continue;
            }
            self.send_to_user(*user_id, notification.clone(), extra.clone())
                .await;
        }
    }

    /// 给整个群组的成员推送；成员名单查不到时放弃本次推送
    pub async fn broadcast_to_group(
        &self,
        group_id: GroupId,
        notification: &Notification,
        exclude: Option<UserId>,
        extra: Option<JsonValue>,
    ) {
        let members = match self.hub.deps.group_store.group_members(group_id).await {
            Ok(members) => members,
            Err(err) => {
                error!(group_id = %group_id, error = %err, "读取群组成员失败，跳过通知推送");
                return;
            }
        };
        self.broadcast_to_audience(&members, notification, exclude, extra)
            .await;
    }
}
