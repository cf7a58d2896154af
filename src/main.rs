use std::env;
use std::fs;
use std::process;
use std::time::Duration;

use notaplay::{AbcConfig, AbcPlayer, AbcSettings, EventLog, MmlPlayer, PlayerError};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: notaplay <song.mml|song.abc>");
        eprintln!("Renders the song's note events to stdout.");
        process::exit(1);
    }

    let path = &args[1];
    let source = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", path, e);
            process::exit(1);
        }
    };

    let trimmed = source.trim_start();
    let looks_like_mml =
        trimmed.len() >= 4 && trimmed.as_bytes()[..4].eq_ignore_ascii_case(b"MML@");

    let result = if looks_like_mml {
        render_mml(&source)
    } else {
        render_abc(&source)
    };

    let log = match result {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Error loading '{}': {}", path, e);
            process::exit(1);
        }
    };

    for event in &log.events {
        println!(
            "{:>9.3}s  ch{:<2} {:<5} vol {:.2}  {:.3}s",
            event.time.as_secs_f64(),
            event.channel,
            event.note.to_string(),
            event.note.volume,
            event.note.length.as_secs_f64(),
        );
    }
}

fn render_mml(source: &str) -> Result<EventLog, PlayerError> {
    let mut player = MmlPlayer::new(EventLog::default());
    player.load(source)?;
    eprintln!(
        "{} track(s), duration {:.3}s",
        player.track_count(),
        player.duration().as_secs_f64()
    );
    player.play(Duration::ZERO);
    drive(|t| {
        player.update(t);
        player.playing()
    });
    Ok(player.close())
}

fn render_abc(source: &str) -> Result<EventLog, PlayerError> {
    let mut player =
        AbcPlayer::with_config(EventLog::default(), AbcConfig::lenient(), AbcSettings::default());
    player.load(source)?;
    eprintln!(
        "{} tune(s), duration {:.3}s",
        player.tune_count(),
        player.duration().as_secs_f64()
    );
    player.play(Duration::ZERO);
    drive(|t| {
        player.update(t);
        player.playing()
    });
    Ok(player.close())
}

fn drive(mut step: impl FnMut(Duration) -> bool) {
    let mut t = Duration::ZERO;
    loop {
        t += Duration::from_millis(10);
        if !step(t) {
            break;
        }
    }
}
