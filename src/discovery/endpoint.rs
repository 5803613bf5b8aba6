//! 服务端点定义
//!
//! 端点是某个逻辑服务的一个可访问实例，由注册方构建一次之后不可变。
//! 注册中心节点中的数据格式为：
//!
//! ```json
//! {"ensemble": "production", "name": "calculator", "id": "host-1:8080", "payload": "..."}
//! ```
//!
//! `name` 是 `service_type` 的历史字段名。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EndPointError;

/// 判断字符是否允许出现在端点名称中
///
/// 只允许无需转义即可出现在 URL 中的字符，这样服务可以用
/// `prod://services/profile-v1` 这样的形式引用
fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':')
}

fn validate(field: &'static str, value: &str) -> Result<(), EndPointError> {
    if value.chars().all(is_valid_char) {
        Ok(())
    } else {
        Err(EndPointError::InvalidCharacters {
            field,
            value: value.to_string(),
        })
    }
}

/// 服务端点
///
/// 相等性和哈希覆盖全部四个字段（包括 payload）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceEndPoint {
    ensemble_name: Option<String>,
    service_type: String,
    id: String,
    payload: Option<String>,
}

impl ServiceEndPoint {
    /// 创建端点构建器
    pub fn builder() -> ServiceEndPointBuilder {
        ServiceEndPointBuilder::default()
    }

    /// 服务组名称（如 "production"），只有一个服务组时可以为空
    pub fn ensemble_name(&self) -> Option<&str> {
        self.ensemble_name.as_deref()
    }

    /// 服务类型（如 "mysql"、"image-server"）
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// 不透明的端点标识
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 注册方提供的附加数据，通常是包含连接信息的 JSON
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// 端点身份（不含 payload）
    pub fn key(&self) -> EndPointKey {
        EndPointKey {
            ensemble_name: self.ensemble_name.clone(),
            service_type: self.service_type.clone(),
            id: self.id.clone(),
        }
    }

    /// 编码为注册中心节点 JSON
    pub fn to_json(&self) -> String {
        self.to_json_with_extras(Map::new())
    }

    /// 编码为注册中心节点 JSON，并附带额外字段（如注册时间）
    ///
    /// 与标准字段同名的额外字段会被覆盖
    pub fn to_json_with_extras(&self, extras: Map<String, Value>) -> String {
        let mut data = extras;
        data.insert("ensemble".to_string(), opt_value(&self.ensemble_name));
        data.insert("name".to_string(), Value::String(self.service_type.clone()));
        data.insert("id".to_string(), Value::String(self.id.clone()));
        data.insert("payload".to_string(), opt_value(&self.payload));
        Value::Object(data).to_string()
    }

    /// 从注册中心节点 JSON 解码
    ///
    /// `name` 和 `id` 必填，`ensemble` 和 `payload` 可缺省或为 null，
    /// 未知字段忽略
    pub fn from_json(json: &str) -> Result<Self, EndPointError> {
        let node: EndPointNode =
            serde_json::from_str(json).map_err(|e| EndPointError::Json(e.to_string()))?;

        let mut builder = ServiceEndPoint::builder()
            .service_type(node.name.ok_or(EndPointError::MissingField("name"))?)
            .id(node.id.ok_or(EndPointError::MissingField("id"))?);
        if let Some(ensemble) = node.ensemble {
            builder = builder.ensemble_name(ensemble);
        }
        if let Some(payload) = node.payload {
            builder = builder.payload(payload);
        }
        builder.build()
    }
}

fn opt_value(value: &Option<String>) -> Value {
    value
        .as_ref()
        .map(|v| Value::String(v.clone()))
        .unwrap_or(Value::Null)
}

impl fmt::Display for ServiceEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServiceEndPoint{{ensemble={}, type={}, id={}}}",
            self.ensemble_name.as_deref().unwrap_or("-"),
            self.service_type,
            self.id
        )
    }
}

/// 注册中心节点的线上格式
#[derive(Debug, Deserialize, Serialize)]
struct EndPointNode {
    #[serde(default)]
    ensemble: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

/// 端点构建器
///
/// 字段在 `build` 时统一校验
#[derive(Debug, Clone, Default)]
pub struct ServiceEndPointBuilder {
    ensemble_name: Option<String>,
    service_type: Option<String>,
    id: Option<String>,
    payload: Option<String>,
}

impl ServiceEndPointBuilder {
    /// 设置服务组名称，空字符串视为未设置
    pub fn ensemble_name(mut self, ensemble_name: impl Into<String>) -> Self {
        let ensemble_name = ensemble_name.into();
        self.ensemble_name = (!ensemble_name.is_empty()).then_some(ensemble_name);
        self
    }

    /// 设置服务类型
    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    /// 设置端点标识
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// 设置附加数据
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// 校验并构建端点
    pub fn build(self) -> Result<ServiceEndPoint, EndPointError> {
        if let Some(ensemble) = &self.ensemble_name {
            validate("ensemble", ensemble)?;
        }

        let service_type = self
            .service_type
            .filter(|s| !s.is_empty())
            .ok_or(EndPointError::MissingField("service_type"))?;
        validate("service_type", &service_type)?;

        let id = self
            .id
            .filter(|s| !s.is_empty())
            .ok_or(EndPointError::MissingField("id"))?;
        validate("id", &id)?;

        Ok(ServiceEndPoint {
            ensemble_name: self.ensemble_name,
            service_type,
            id,
            payload: self.payload,
        })
    }
}

/// 端点身份：`(ensemble, service_type, id)`
///
/// 用作服务发现快照和实例缓存的键，payload 变化不改变身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndPointKey {
    ensemble_name: Option<String>,
    service_type: String,
    id: String,
}

impl EndPointKey {
    /// 直接构造端点身份（不做字符校验，供注册中心后端从节点路径还原）
    pub fn new(
        ensemble_name: Option<String>,
        service_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            ensemble_name,
            service_type: service_type.into(),
            id: id.into(),
        }
    }

    pub fn ensemble_name(&self) -> Option<&str> {
        self.ensemble_name.as_deref()
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EndPointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.ensemble_name.as_deref().unwrap_or("-"),
            self.service_type,
            self.id
        )
    }
}

impl From<&ServiceEndPoint> for EndPointKey {
    fn from(end_point: &ServiceEndPoint) -> Self {
        end_point.key()
    }
}
