use super::settings::Audio;
use crate::{
    command::{self, CommandRunner},
    http_response::InputError,
};
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

const MAX_VOLUME: i32 = 10;

pub struct AudioService;

impl AudioService {
    /// Parse the `volume` form field, 0 to 10
    pub fn parse_volume(volume: &str) -> Result<u8> {
        let parsed: i32 = volume
            .trim()
            .parse()
            .map_err(|_| InputError::new(format!("failed to parse '{volume}' to an int")))?;

        if !(0..=MAX_VOLUME).contains(&parsed) {
            return Err(
                InputError::new(format!("volume must be between 0 and {MAX_VOLUME}")).into(),
            );
        }

        Ok(parsed as u8)
    }

    /// Set the mixer to `volume` and play the test sound through the speaker
    pub async fn play_test_sound<R>(
        runner: &R,
        audio: &Audio,
        sound: &Path,
        volume: u8,
    ) -> Result<String>
    where
        R: CommandRunner + Sync,
    {
        let card = audio.card.to_string();
        let level = format!("{}%", u32::from(volume) * 10);

        command::run(
            runner,
            "amixer",
            &["-c", &card, "sset", &audio.volume_control, &level],
        )
        .await
        .context("unable to set the volume")?;

        let sound = sound
            .to_str()
            .with_context(|| format!("invalid test sound path {sound:?}"))?;

        info!("playing test sound at {level}");
        command::run(runner, "play", &["-t", "wav", "--norm=-3", "-q", sound])
            .await
            .context("unable to play audio")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, testing::ScriptedRunner};

    #[test]
    fn volume_must_be_an_int_in_range() {
        assert_eq!(AudioService::parse_volume("7").unwrap(), 7);

        let err = AudioService::parse_volume("loud").unwrap_err();
        assert_eq!(err.to_string(), "failed to parse 'loud' to an int");

        let err = AudioService::parse_volume("11").unwrap_err();
        assert!(err.downcast_ref::<InputError>().is_some());
    }

    #[tokio::test]
    async fn volume_is_set_before_playing() {
        let runner = ScriptedRunner::default();
        let audio = Audio {
            card: 1,
            volume_control: "Speaker".to_string(),
        };

        AudioService::play_test_sound(&runner, &audio, Path::new("/usr/share/test.wav"), 7)
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "amixer -c 1 sset Speaker 70%",
                "play -t wav --norm=-3 -q /usr/share/test.wav",
            ]
        );
    }

    #[tokio::test]
    async fn mixer_failure_skips_playback() {
        let runner = ScriptedRunner::default();
        runner.on("amixer", CommandOutput::failed(1, "Invalid card"));

        let err = AudioService::play_test_sound(&runner, &Audio::default(), Path::new("t.wav"), 5)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "unable to set the volume");
        assert_eq!(runner.count("play -t wav --norm=-3 -q t.wav"), 0);
    }
}
