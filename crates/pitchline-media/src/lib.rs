//! Media pipeline: streaming and batch STT, TTS, silence-based turn
//! detection, and the realtime voice session bridge.

pub mod audio_queue;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod voice_session;
