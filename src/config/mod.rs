pub mod logger_config;

pub use logger_config::{
    config_file_path, load_logger_config, BridgeConfig, BusConfig, Interface, LoggerConfig,
    OutputConfig, SamplingConfig,
};
