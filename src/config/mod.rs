// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// HTTP 客户端配置
    #[serde(default)]
    pub http: HttpConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 各服务商接口地址
    #[serde(default)]
    pub providers: ProviderEndpoints,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// 单个请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 建连超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    // 分片上传可能持续较久
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "CloudServiceKit".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 并发上传时的最大分片数
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    /// 对象存储分片大小 (MB)
    #[serde(default = "default_oss_part_size_mb")]
    pub oss_part_size_mb: u64,
}

fn default_max_concurrent_parts() -> usize {
    4
}

fn default_oss_part_size_mb() -> u64 {
    10
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_parts: default_max_concurrent_parts(),
            oss_part_size_mb: default_oss_part_size_mb(),
        }
    }
}

impl UploadConfig {
    /// 对象存储分片大小（字节）
    pub fn oss_part_size(&self) -> u64 {
        self.oss_part_size_mb * 1024 * 1024
    }
}

/// 各服务商接口地址
///
/// 默认值为官方地址，测试或私有部署时可覆盖
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    #[serde(default = "default_aliyun_api")]
    pub aliyun_api: String,
    #[serde(default = "default_baidu_api")]
    pub baidu_api: String,
    #[serde(default = "default_baidu_upload")]
    pub baidu_upload: String,
    #[serde(default = "default_box_api")]
    pub box_api: String,
    #[serde(default = "default_box_upload")]
    pub box_upload: String,
    #[serde(default = "default_dropbox_api")]
    pub dropbox_api: String,
    #[serde(default = "default_dropbox_content")]
    pub dropbox_content: String,
    #[serde(default = "default_google_drive_api")]
    pub google_drive_api: String,
    #[serde(default = "default_google_drive_upload")]
    pub google_drive_upload: String,
    #[serde(default = "default_onedrive_api")]
    pub onedrive_api: String,
    #[serde(default = "default_pcloud_api")]
    pub pcloud_api: String,
    #[serde(default = "default_cloud189_api")]
    pub cloud189_api: String,
    #[serde(default = "default_drive123_api")]
    pub drive123_api: String,
    #[serde(default = "default_drive115_api")]
    pub drive115_api: String,
    #[serde(default = "default_drive115_web_api")]
    pub drive115_web_api: String,
    #[serde(default = "default_drive115_aps_api")]
    pub drive115_aps_api: String,
    #[serde(default = "default_quark_api")]
    pub quark_api: String,
}

fn default_aliyun_api() -> String {
    "https://api.aliyundrive.com".to_string()
}

fn default_baidu_api() -> String {
    "https://pan.baidu.com/rest/2.0".to_string()
}

fn default_baidu_upload() -> String {
    "https://d.pcs.baidu.com/rest/2.0".to_string()
}

fn default_box_api() -> String {
    "https://api.box.com/2.0".to_string()
}

fn default_box_upload() -> String {
    "https://upload.box.com/api/2.0".to_string()
}

fn default_dropbox_api() -> String {
    "https://api.dropboxapi.com/2".to_string()
}

fn default_dropbox_content() -> String {
    "https://content.dropboxapi.com/2".to_string()
}

fn default_google_drive_api() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_google_drive_upload() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_onedrive_api() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_pcloud_api() -> String {
    "https://api.pcloud.com".to_string()
}

fn default_cloud189_api() -> String {
    "https://api.cloud.189.cn/app/open/api".to_string()
}

fn default_drive123_api() -> String {
    "https://open-api.123pan.com".to_string()
}

fn default_drive115_api() -> String {
    "https://proapi.115.com".to_string()
}

fn default_drive115_web_api() -> String {
    "https://webapi.115.com".to_string()
}

fn default_drive115_aps_api() -> String {
    "https://aps.115.com".to_string()
}

fn default_quark_api() -> String {
    "https://drive.quark.cn/1/clouddrive".to_string()
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            aliyun_api: default_aliyun_api(),
            baidu_api: default_baidu_api(),
            baidu_upload: default_baidu_upload(),
            box_api: default_box_api(),
            box_upload: default_box_upload(),
            dropbox_api: default_dropbox_api(),
            dropbox_content: default_dropbox_content(),
            google_drive_api: default_google_drive_api(),
            google_drive_upload: default_google_drive_upload(),
            onedrive_api: default_onedrive_api(),
            pcloud_api: default_pcloud_api(),
            cloud189_api: default_cloud189_api(),
            drive123_api: default_drive123_api(),
            drive115_api: default_drive115_api(),
            drive115_web_api: default_drive115_web_api(),
            drive115_aps_api: default_drive115_aps_api(),
            quark_api: default_quark_api(),
        }
    }
}

impl AppConfig {
    /// 检查配置取值
    pub fn validate(&self) -> Result<()> {
        if self.upload.max_concurrent_parts == 0 {
            anyhow::bail!("上传并发分片数必须大于 0");
        }
        if self.upload.oss_part_size_mb == 0 {
            anyhow::bail!("对象存储分片大小必须大于 0");
        }
        if self.http.timeout_secs == 0 || self.http.connect_timeout_secs == 0 {
            anyhow::bail!("HTTP 超时时间必须大于 0");
        }
        if self.log.max_file_size == 0 {
            anyhow::bail!("单个日志文件大小必须大于 0");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件取值校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败：配置取值无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
