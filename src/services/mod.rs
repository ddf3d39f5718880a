pub mod audio;
pub mod clock;
pub mod device;
pub mod network;
pub mod recordings;
pub mod settings;
pub mod system;
