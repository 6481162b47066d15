//! NVR 服务器接入：登录、事件图片、摄像头发现

pub mod client;
pub mod discovery;

pub use client::{parse_token_cookie, NvrClient};
pub use discovery::{cameras_from_config, extract_host};
