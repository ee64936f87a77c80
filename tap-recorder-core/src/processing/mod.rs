pub mod stereo_mixer;
pub mod wav_format;
