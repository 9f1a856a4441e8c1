pub mod ping;

pub use ping::PingTool;
