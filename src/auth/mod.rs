// 认证模块
//
// 凭证持有与刷新回调；OAuth 授权流程由调用方完成

mod cookie;
mod credential;

pub use cookie::{replace_cookie, set_cookie_pair, CookieRefreshedFn};
pub use credential::{refresh_fn, Credential, CredentialCell, RefreshHandler};
