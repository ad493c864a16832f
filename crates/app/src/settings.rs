use config::{Config, ConfigError, Environment, File, FileFormat};
use klinefeed_core::config::AppConfig;
use std::path::Path;

/// 默认配置文件名 (不含扩展名)，位于工作目录。
const DEFAULT_FILE: &str = "klinefeed";
/// 指定配置文件路径的环境变量。
const PATH_ENV: &str = "KLINEFEED_CONFIG";
/// 覆盖单个字段的环境变量前缀，例如 `KLINEFEED__FEED__SYMBOL`。
const ENV_PREFIX: &str = "KLINEFEED";

/// # Summary
/// 加载应用配置。
///
/// # Logic
/// 1. 以内置默认值为底。
/// 2. 叠加配置文件：`KLINEFEED_CONFIG` 指定的路径 (必须存在)，否则为可选的 `klinefeed.toml`。
/// 3. 叠加 `KLINEFEED__*` 环境变量。
///
/// # Returns
/// 合并后的配置，文件格式错误或字段类型不符时返回 `ConfigError`。
pub fn load() -> Result<AppConfig, ConfigError> {
    let file = match std::env::var(PATH_ENV) {
        Ok(path) => File::from(Path::new(&path)).format(FileFormat::Toml).required(true),
        Err(_) => File::with_name(DEFAULT_FILE).format(FileFormat::Toml).required(false),
    };
    build(file, Environment::with_prefix(ENV_PREFIX))
}

fn build<F>(file: F, env: Environment) -> Result<AppConfig, ConfigError>
where
    F: config::Source + Send + Sync + 'static,
{
    Config::builder()
        .add_source(Config::try_from(&AppConfig::default())?)
        .add_source(file)
        .add_source(
            env.prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use klinefeed_core::common::Interval;
    use klinefeed_core::config::RunMode;
    use std::collections::HashMap;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults_without_file() {
        let file = File::with_name("does-not-exist").required(false);
        let config = build(file, no_env()).unwrap();
        assert_eq!(config.mode, RunMode::Live);
        assert_eq!(config.feed.length, 3600);
        assert_eq!(config.store.data_dir, "data");
    }

    #[test]
    fn test_file_then_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klinefeed.toml");
        std::fs::write(
            &path,
            r#"
            mode = "playback"

            [feed]
            symbol = "ETHUSDT"
            interval = "1m"
            length = 120

            [playback]
            start = 1000
            end = 5000
            "#,
        )
        .unwrap();

        let env = Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::from([
            ("KLINEFEED__FEED__LENGTH".to_string(), "240".to_string()),
            ("KLINEFEED__LOG__LEVEL".to_string(), "debug".to_string()),
        ])));
        let file = File::from(path.as_path()).format(FileFormat::Toml);
        let config = build(file, env).unwrap();

        assert_eq!(config.mode, RunMode::Playback);
        assert_eq!(config.feed.symbol, "ETHUSDT");
        assert_eq!(config.feed.interval, Interval::Minute1);
        assert_eq!(config.feed.length, 240);
        assert_eq!(config.feed.poll_limit, 5);
        assert_eq!(config.playback.end, 5000);
        assert_eq!(config.log.level, "debug");
    }
}
