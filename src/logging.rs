//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化；文件按启动时间命名、按大小滚动，启动时清理过期日志

use crate::config::LogConfig;
use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "cloud-service-rust.";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志文件管理器（内部状态）
struct LogFileState {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    current_file: Option<File>,
    /// 当前文件序号（0 为基础文件）
    current_index: u32,
    max_file_size: u64,
    current_size: u64,
}

impl LogFileState {
    fn new(log_dir: PathBuf, max_file_size: u64, start_timestamp: String) -> io::Result<Self> {
        let mut state = Self {
            start_timestamp,
            log_dir,
            current_file: None,
            current_index: 0,
            max_file_size,
            current_size: 0,
        };
        state.open_current()?;
        Ok(state)
    }

    /// cloud-service-rust.{时间戳}.log / cloud-service-rust.{时间戳}_{N}.log
    fn file_path(&self, index: u32) -> PathBuf {
        let filename = if index == 0 {
            format!("{}{}.log", LOG_FILE_PREFIX, self.start_timestamp)
        } else {
            format!("{}{}_{}.log", LOG_FILE_PREFIX, self.start_timestamp, index)
        };
        self.log_dir.join(filename)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let path = self.file_path(self.current_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.current_file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current_file.take() {
            file.flush()?;
        }
        self.current_index += 1;
        self.open_current()
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志导致无限滚动
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_file_size {
            self.rotate()?;
        }

        match &mut self.current_file {
            Some(file) => {
                let written = file.write(buf)?;
                self.current_size += written as u64;
                Ok(written)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush_file(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.current_file {
            file.flush()?;
        }
        Ok(())
    }
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct LogFileManager {
    inner: Arc<Mutex<LogFileState>>,
}

impl LogFileManager {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        Self::with_timestamp(log_dir, max_file_size, timestamp)
    }

    fn with_timestamp(log_dir: PathBuf, max_file_size: u64, timestamp: String) -> io::Result<Self> {
        let state = LogFileState::new(log_dir, max_file_size, timestamp)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
        })
    }
}

impl Write for LogFileManager {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush_file()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 文件输出初始化失败时回退到仅控制台输出；全局订阅器已存在时保持原订阅器
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let file_manager = if config.enabled {
        match open_file_sink(config) {
            Ok(manager) => Some(manager),
            Err(e) => {
                eprintln!("{:#}，回退到仅控制台输出", e);
                None
            }
        }
    } else {
        None
    };

    let Some(file_manager) = file_manager else {
        if let Err(e) = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
        {
            eprintln!("日志订阅器已存在，跳过初始化: {}", e);
        }
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_manager);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("日志订阅器已存在，跳过初始化: {}", e);
    }

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

fn open_file_sink(config: &LogConfig) -> Result<LogFileManager> {
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("创建日志目录失败: {:?}", config.log_dir))?;
    LogFileManager::new(config.log_dir.clone(), config.max_file_size)
        .context("创建日志文件管理器失败")
}

/// 清理过期日志文件，返回删除数量
///
/// 优先按文件名中的日期判断，无法解析时按修改时间
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let filename = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(".log") {
            continue;
        }

        let expired = match extract_date_from_filename(filename)
            .and_then(|date| chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok())
        {
            Some(file_date) => today.signed_duration_since(file_date) > retention,
            None => expired_by_modified_time(&entry, retention),
        };

        if expired {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }

    deleted_count
}

/// 从文件名中提取日期部分
///
/// - cloud-service-rust.YYYY-MM-DD-HHMMSS.log -> YYYY-MM-DD
/// - cloud-service-rust.YYYY-MM-DD-HHMMSS_N.log -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<String> {
    let name = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(".log")?;
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() >= 3 {
        Some(format!("{}-{}-{}", parts[0], parts[1], parts[2]))
    } else {
        None
    }
}

fn expired_by_modified_time(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let modified = match entry.metadata().and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    let modified: chrono::DateTime<chrono::Utc> = modified.into();
    chrono::Utc::now().signed_duration_since(modified) > retention
}
