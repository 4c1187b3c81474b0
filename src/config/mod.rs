mod settings;

pub use settings::{
    ApiConfig, BatcherConfig, HealthConfig, LimitsConfig, LoggingConfig, MatchmakingConfig,
    ProfileConfig, RoomConfig, ServerConfig, Settings, ShutdownSettings, StaticIdentity,
    WebSocketConfig,
};
