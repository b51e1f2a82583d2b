// Cookie 凭证
//
// Cookie 登录的服务商把整串 Cookie 存在 Credential::token 中，
// 服务端通过 Set-Cookie 轮换其中的个别字段

use std::sync::Arc;

/// Cookie 被服务端轮换后的回调，参数为新的整串 Cookie，由调用方负责持久化
pub type CookieRefreshedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// 取 Set-Cookie 头中的 `name=value` 部分
pub fn set_cookie_pair(header: &str) -> Option<&str> {
    let pair = header.split(';').next()?.trim();
    if pair.contains('=') {
        Some(pair)
    } else {
        None
    }
}

fn cookie_name(pair: &str) -> &str {
    pair.split('=').next().unwrap_or_default().trim()
}

/// 用 `pair` 替换 Cookie 串中同名的字段
///
/// 原 Cookie 中没有该字段，或取值未变时返回 None
pub fn replace_cookie(cookie: &str, pair: &str) -> Option<String> {
    let name = cookie_name(pair);
    let mut replaced = false;
    let mut changed = false;
    let components: Vec<String> = cookie
        .split(';')
        .map(|component| {
            if !replaced && cookie_name(component) == name {
                replaced = true;
                changed = component.trim() != pair;
                // 保留分隔符后的空格
                let indent = &component[..component.len() - component.trim_start().len()];
                format!("{}{}", indent, pair)
            } else {
                component.to_string()
            }
        })
        .collect();

    if changed {
        Some(components.join(";"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_cookie_pair() {
        assert_eq!(
            set_cookie_pair("__puus=abc; Path=/; HttpOnly"),
            Some("__puus=abc")
        );
        assert_eq!(set_cookie_pair("HttpOnly"), None);
    }

    #[test]
    fn test_replace_cookie_keeps_other_fields() {
        let cookie = "__pus=p1; __puus=old; __kp=k1";
        assert_eq!(
            replace_cookie(cookie, "__puus=new").as_deref(),
            Some("__pus=p1; __puus=new; __kp=k1")
        );
    }

    #[test]
    fn test_replace_cookie_ignores_absent_or_unchanged() {
        assert!(replace_cookie("__pus=p1", "__puus=new").is_none());
        assert!(replace_cookie("__pus=p1; __puus=same", "__puus=same").is_none());
        // 名称需完全匹配
        assert!(replace_cookie("x__puus=old", "__puus=new").is_none());
    }
}
