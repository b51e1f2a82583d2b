// 响应错误分类器
//
// 传输成功的响应先交给分类器，识别各服务商嵌在响应体中的业务错误

use crate::http::RawResponse;
use serde_json::Value;

/// 业务错误（错误码 + 消息）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub code: i64,
    pub message: Option<String>,
}

impl ServiceFailure {
    pub fn new(code: i64, message: Option<String>) -> Self {
        Self { code, message }
    }
}

/// 响应分类器：纯函数，不做任何 I/O
pub trait ResponseClassifier: Send + Sync {
    /// 响应体携带业务错误时返回 Some
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure>;

    /// 是否为授权失效（默认仅 HTTP 401）
    fn is_unauthorized(&self, response: &RawResponse) -> bool {
        response.status() == 401
    }
}

/// 数字或数字字符串
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn as_string(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// 阿里云盘：`code` + `message`，409 为秒传预检命中，不视为错误
#[derive(Debug, Default, Clone, Copy)]
pub struct AliyunClassifier;

impl ResponseClassifier for AliyunClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        if response.status() == 409 {
            return None;
        }
        let json = response.json()?;
        let code = json.get("code")?.as_str()?;
        let message = json.get("message")?.as_str()?;
        Some(ServiceFailure::new(-1, Some(format!("{}: {}", code, message))))
    }

    fn is_unauthorized(&self, response: &RawResponse) -> bool {
        if response.status() == 401 {
            return true;
        }
        response
            .json()
            .and_then(|json| as_string(json.get("code")))
            .map_or(false, |code| {
                code == "AccessTokenInvalid" || code == "AccessTokenExpired"
            })
    }
}

/// 百度网盘：`errno` 非 0 且非 133
#[derive(Debug, Default, Clone, Copy)]
pub struct BaiduClassifier;

impl ResponseClassifier for BaiduClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let errno = json.get("errno").and_then(as_i64)?;
        if errno == 0 || errno == 133 {
            return None;
        }
        Some(ServiceFailure::new(errno, as_string(json.get("errmsg"))))
    }

    fn is_unauthorized(&self, response: &RawResponse) -> bool {
        if response.status() == 401 {
            return true;
        }
        response
            .json()
            .and_then(|json| json.get("errno").and_then(as_i64))
            .map_or(false, |errno| errno == -6 || errno == 111)
    }
}

/// Box：`type == "error"`
#[derive(Debug, Default, Clone, Copy)]
pub struct BoxClassifier;

impl ResponseClassifier for BoxClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        if json.get("type").and_then(Value::as_str) != Some("error") {
            return None;
        }
        Some(ServiceFailure::new(
            response.status() as i64,
            as_string(json.get("message")),
        ))
    }
}

/// Dropbox：非空的 `error` 对象
#[derive(Debug, Default, Clone, Copy)]
pub struct DropboxClassifier;

impl ResponseClassifier for DropboxClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let error = json.get("error")?;
        let non_empty = match error {
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
            _ => true,
        };
        if !non_empty {
            return None;
        }
        let message = as_string(json.get("user_message"))
            .or_else(|| as_string(json.get("error_summary")));
        Some(ServiceFailure::new(response.status() as i64, message))
    }
}

/// Google Drive：`error` 对象，缺省错误码 400
#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleDriveClassifier;

impl ResponseClassifier for GoogleDriveClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let error = json.get("error")?;
        if !error.is_object() {
            return None;
        }
        let code = error.get("code").and_then(as_i64).unwrap_or(400);
        let message = as_string(error.get("message")).or_else(|| {
            error
                .get("errors")
                .and_then(|errors| errors.get(0))
                .and_then(|first| as_string(first.get("message")))
        });
        Some(ServiceFailure::new(code, message))
    }
}

/// OneDrive：`error` 对象
#[derive(Debug, Default, Clone, Copy)]
pub struct OneDriveClassifier;

impl ResponseClassifier for OneDriveClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let error = json.get("error")?;
        if !error.is_object() {
            return None;
        }
        Some(ServiceFailure::new(
            response.status() as i64,
            as_string(error.get("message")),
        ))
    }
}

/// pCloud：`result` 非 0
#[derive(Debug, Default, Clone, Copy)]
pub struct PCloudClassifier;

impl ResponseClassifier for PCloudClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let result = json.get("result").and_then(as_i64)?;
        if result == 0 {
            return None;
        }
        Some(ServiceFailure::new(result, as_string(json.get("error"))))
    }

    fn is_unauthorized(&self, response: &RawResponse) -> bool {
        if response.status() == 401 {
            return true;
        }
        // 2094: Invalid 'access_token' provided
        response
            .json()
            .and_then(|json| json.get("result").and_then(as_i64))
            == Some(2094)
    }
}

/// 123云盘：`code` 非 0
#[derive(Debug, Default, Clone, Copy)]
pub struct Drive123Classifier;

impl ResponseClassifier for Drive123Classifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let code = json.get("code").and_then(as_i64)?;
        if code == 0 {
            return None;
        }
        let message = as_string(json.get("message")).or_else(|| Some("Unknown error".to_string()));
        Some(ServiceFailure::new(code, message))
    }

    fn is_unauthorized(&self, response: &RawResponse) -> bool {
        response.status() == 401
            || response
                .json()
                .and_then(|json| json.get("code").and_then(as_i64))
                == Some(401)
    }
}

/// 天翼云盘：`res_code` 非 0，或带 `errorCode`
#[derive(Debug, Default, Clone, Copy)]
pub struct Cloud189Classifier;

impl ResponseClassifier for Cloud189Classifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        if let Some(code) = json.get("res_code") {
            let code = as_i64(code).unwrap_or(-1);
            if code == 0 {
                return None;
            }
            return Some(ServiceFailure::new(code, as_string(json.get("res_message"))));
        }
        let error_code = as_string(json.get("errorCode"))?;
        let message = as_string(json.get("errorMsg")).unwrap_or(error_code);
        Some(ServiceFailure::new(-1, Some(message)))
    }

    fn is_unauthorized(&self, response: &RawResponse) -> bool {
        if response.status() == 401 {
            return true;
        }
        response
            .json()
            .and_then(|json| {
                as_string(json.get("errorCode")).or_else(|| as_string(json.get("res_code")))
            })
            .map_or(false, |code| {
                code == "InvalidAccessToken" || code == "InvalidSessionKey"
            })
    }
}

/// 115 网盘：`state == false` 或 `code` 非 0
#[derive(Debug, Default, Clone, Copy)]
pub struct Drive115Classifier;

impl ResponseClassifier for Drive115Classifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let code = json.get("code").and_then(as_i64).unwrap_or(0);
        let failed_state = json.get("state").and_then(Value::as_bool) == Some(false);
        if code == 0 && !failed_state {
            return None;
        }
        let message = as_string(json.get("message")).or_else(|| as_string(json.get("error")));
        Some(ServiceFailure::new(if code == 0 { -1 } else { code }, message))
    }

    fn is_unauthorized(&self, response: &RawResponse) -> bool {
        if response.status() == 401 {
            return true;
        }
        response
            .json()
            .and_then(|json| json.get("code").and_then(as_i64))
            .map_or(false, |code| code == 40140125 || code == 40140126)
    }
}

/// 夸克网盘：`code` 非 0 为错误
#[derive(Debug, Default, Clone, Copy)]
pub struct QuarkClassifier;

impl ResponseClassifier for QuarkClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        let code = json.get("code").and_then(as_i64)?;
        if code == 0 {
            return None;
        }
        Some(ServiceFailure::new(code, as_string(json.get("message"))))
    }
}

/// 115 网页接口：`state: false` 为错误，错误码取 errNo / errno / code
#[derive(Debug, Default, Clone, Copy)]
pub struct Drive115WebClassifier;

impl ResponseClassifier for Drive115WebClassifier {
    fn classify(&self, response: &RawResponse) -> Option<ServiceFailure> {
        let json = response.json()?;
        if json.get("state").and_then(Value::as_bool) != Some(false) {
            return None;
        }
        let code = ["errNo", "errno", "code"]
            .iter()
            .find_map(|key| json.get(*key).and_then(as_i64))
            .filter(|code| *code != 0)
            .unwrap_or(-1);
        let message = as_string(json.get("error")).or_else(|| as_string(json.get("msg")));
        Some(ServiceFailure::new(code, message))
    }
}

/// 不识别任何业务错误（OSS 等由调用方自行检查状态码）
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughClassifier;

impl ResponseClassifier for PassthroughClassifier {
    fn classify(&self, _response: &RawResponse) -> Option<ServiceFailure> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resp(status: u16, body: Value) -> RawResponse {
        RawResponse::from_json(status, &body)
    }

    #[test]
    fn test_aliyun_classifier() {
        let failure = AliyunClassifier
            .classify(&resp(400, json!({"code": "NotFound.File", "message": "not found"})))
            .unwrap();
        assert_eq!(failure.code, -1);
        // 409 为预检命中
        assert!(AliyunClassifier
            .classify(&resp(409, json!({"code": "PreHashMatched", "message": "matched"})))
            .is_none());
        assert!(AliyunClassifier
            .is_unauthorized(&resp(401, json!({"code": "AccessTokenInvalid", "message": "x"}))));
    }

    #[test]
    fn test_baidu_classifier() {
        let failure = BaiduClassifier
            .classify(&resp(200, json!({"errno": 31066, "errmsg": "file not exist"})))
            .unwrap();
        assert_eq!(failure, ServiceFailure::new(31066, Some("file not exist".to_string())));
        assert!(BaiduClassifier.classify(&resp(200, json!({"errno": 0}))).is_none());
        assert!(BaiduClassifier.classify(&resp(200, json!({"errno": 133}))).is_none());
        assert!(BaiduClassifier.is_unauthorized(&resp(200, json!({"errno": -6}))));
    }

    #[test]
    fn test_dropbox_empty_error_is_success() {
        assert!(DropboxClassifier.classify(&resp(200, json!({"error": {}}))).is_none());
        let failure = DropboxClassifier
            .classify(&resp(
                409,
                json!({"error_summary": "path/not_found/", "error": {".tag": "path"}}),
            ))
            .unwrap();
        assert_eq!(failure.code, 409);
        assert_eq!(failure.message.as_deref(), Some("path/not_found/"));
    }

    #[test]
    fn test_google_classifier_defaults() {
        let failure = GoogleDriveClassifier
            .classify(&resp(200, json!({"error": {"errors": [{"message": "Rate Limit"}]}})))
            .unwrap();
        assert_eq!(failure.code, 400);
        assert_eq!(failure.message.as_deref(), Some("Rate Limit"));
    }

    #[test]
    fn test_onedrive_error_object_in_200() {
        let failure = OneDriveClassifier
            .classify(&resp(200, json!({"error": {"code": "x", "message": "boom"}})))
            .unwrap();
        assert_eq!(failure.code, 200);
        assert!(OneDriveClassifier.classify(&resp(200, json!({"id": "1"}))).is_none());
    }

    #[test]
    fn test_numeric_string_codes() {
        assert_eq!(
            Cloud189Classifier
                .classify(&resp(200, json!({"res_code": "0"})))
                .map(|f| f.code),
            None
        );
        assert_eq!(
            Cloud189Classifier
                .classify(&resp(400, json!({"errorCode": "InvalidSessionKey", "errorMsg": "expired"})))
                .and_then(|f| f.message),
            Some("expired".to_string())
        );
        assert_eq!(
            Drive123Classifier
                .classify(&resp(200, json!({"code": 5113})))
                .and_then(|f| f.message),
            Some("Unknown error".to_string())
        );
    }

    #[test]
    fn test_box_pcloud_115() {
        assert_eq!(
            BoxClassifier
                .classify(&resp(409, json!({"type": "error", "message": "Item with the same name already exists"})))
                .map(|f| f.code),
            Some(409)
        );
        assert_eq!(
            PCloudClassifier
                .classify(&resp(200, json!({"result": 2005, "error": "Directory does not exist."})))
                .map(|f| f.code),
            Some(2005)
        );
        assert_eq!(
            Drive115Classifier
                .classify(&resp(200, json!({"state": false, "message": "参数错误"})))
                .map(|f| f.code),
            Some(-1)
        );
        assert!(Drive115Classifier
            .classify(&resp(200, json!({"state": true, "code": 0})))
            .is_none());
    }

    #[test]
    fn test_quark_code_nonzero() {
        assert_eq!(
            QuarkClassifier.classify(&resp(200, json!({"code": 41013, "message": "file not found"}))),
            Some(ServiceFailure::new(41013, Some("file not found".to_string())))
        );
        assert!(QuarkClassifier
            .classify(&resp(200, json!({"code": 0, "data": {}})))
            .is_none());
    }

    #[test]
    fn test_drive115_web_state_false() {
        assert_eq!(
            Drive115WebClassifier
                .classify(&resp(200, json!({"state": false, "errNo": 20130827, "error": "x"})))
                .map(|f| f.code),
            Some(20130827)
        );
        assert_eq!(
            Drive115WebClassifier
                .classify(&resp(200, json!({"state": false, "msg": "登录超时"}))),
            Some(ServiceFailure::new(-1, Some("登录超时".to_string())))
        );
        assert!(Drive115WebClassifier
            .classify(&resp(200, json!({"state": true, "data": []})))
            .is_none());
    }

    #[test]
    fn test_non_json_body_is_not_claimed() {
        let raw = RawResponse::new(500, Default::default(), b"<html>bad gateway</html>".to_vec());
        assert!(BaiduClassifier.classify(&raw).is_none());
        assert!(PassthroughClassifier.classify(&raw).is_none());
    }
}
