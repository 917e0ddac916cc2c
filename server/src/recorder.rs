//! Play-test analytics.
//!
//! While recording is enabled a ship samples the positions of players walking around it and
//! collects per-minigame results. At the end of the session everything is folded into one
//! [`SessionRecord`] and handed to a [`RecordSink`]. Sinks are write-only and best effort:
//! a failing sink logs and drops the record.

use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::roster::{PlayerId, Roster};
use crate::timer::Timer;
use crate::utils::unix_millis;
use shared::Position;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapSample {
    pub name: String,
    pub team: usize,
    pub x: f64,
    pub y: f64,
    /// Seconds since the ship started.
    pub t: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerResult {
    pub name: String,
    pub team: usize,
    pub score: f64,
    pub won: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinigameSession {
    pub minigame: String,
    pub flag: String,
    pub duration_secs: f64,
    pub ended_at_ms: u64,
    pub results: Vec<PlayerResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mvp {
    pub name: String,
    pub score: f64,
}

/// Everything recorded about one ship session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub lobby: String,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub duration_secs: f64,
    pub team_scores: [u32; 2],
    pub mvp: Option<Mvp>,
    pub heatmap: Vec<HeatmapSample>,
    pub minigames: Vec<MinigameSession>,
}

/// Destination for finished session records.
pub trait RecordSink: Send + Sync {
    fn submit(&self, record: SessionRecord);
}

/// Appends one JSON document per line to a file on a blocking worker thread.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonLinesSink { path: path.into() }
    }

    fn append(path: &PathBuf, record: &SessionRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())
    }
}

impl RecordSink for JsonLinesSink {
    fn submit(&self, record: SessionRecord) {
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || match JsonLinesSink::append(&path, &record) {
            Ok(()) => info!("lobby {}: session record written to {}", record.lobby, path.display()),
            Err(e) => error!("lobby {}: failed to write session record: {}", record.lobby, e),
        });
    }
}

/// Keeps records in memory. Useful for tests and tooling.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySink::default())
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RecordSink for MemorySink {
    fn submit(&self, record: SessionRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Per-ship collector.
#[derive(Debug)]
pub struct Recorder {
    started_at_ms: u64,
    started: Instant,
    heatmap: Vec<HeatmapSample>,
    sessions: Vec<MinigameSession>,
    pub(crate) timer: Timer,
}

impl Recorder {
    pub fn new(timer: Timer) -> Self {
        Recorder {
            started_at_ms: unix_millis(),
            started: Instant::now(),
            heatmap: Vec::new(),
            sessions: Vec::new(),
            timer,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Records one sample for each listed player with a known position.
    pub fn sample<I>(&mut self, roster: &Roster, positions: I)
    where
        I: IntoIterator<Item = (PlayerId, Position)>,
    {
        let t = self.elapsed_secs();

        for (id, pos) in positions {
            if let Some(player) = roster.get(id) {
                self.heatmap.push(HeatmapSample {
                    name: player.name.clone(),
                    team: player.team.index(),
                    x: pos.x,
                    y: pos.y,
                    t,
                });
            }
        }
    }

    pub fn add_session(&mut self, session: MinigameSession) {
        self.sessions.push(session);
    }

    pub fn heatmap_len(&self) -> usize {
        self.heatmap.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops sampling and builds the final record. The MVP is the first player with the
    /// strictly highest positive score.
    pub fn finish(
        mut self,
        lobby: &str,
        team_scores: [u32; 2],
        individual: &[(String, f64)],
    ) -> SessionRecord {
        self.timer.stop();

        let mvp = individual
            .iter()
            .filter(|(_, score)| *score > 0.0)
            .fold(None::<&(String, f64)>, |best, entry| match best {
                Some(b) if b.1 >= entry.1 => Some(b),
                _ => Some(entry),
            })
            .map(|(name, score)| Mvp {
                name: name.clone(),
                score: *score,
            });

        SessionRecord {
            lobby: lobby.to_string(),
            started_at_ms: self.started_at_ms,
            ended_at_ms: unix_millis(),
            duration_secs: self.elapsed_secs(),
            team_scores,
            mvp,
            heatmap: self.heatmap,
            minigames: self.sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::tests::conn;

    #[test]
    fn test_sample_uses_roster_names() {
        let mut roster = Roster::new();
        let a = roster.add_player("A".into(), conn(1).0);
        let mut recorder = Recorder::new(Timer::expired());

        recorder.sample(
            &roster,
            vec![(a, Position::new(1.0, 2.0)), (PlayerId(u32::MAX), Position::default())],
        );

        assert_eq!(recorder.heatmap_len(), 1);
    }

    #[test]
    fn test_finish_picks_mvp() {
        let recorder = Recorder::new(Timer::expired());

        let record = recorder.finish(
            "1234",
            [3, 1],
            &[("A".into(), 1.0), ("B".into(), 2.0), ("C".into(), 2.0)],
        );

        assert_eq!(record.lobby, "1234");
        assert_eq!(record.team_scores, [3, 1]);
        assert_eq!(
            record.mvp,
            Some(Mvp {
                name: "B".into(),
                score: 2.0
            })
        );
    }

    #[test]
    fn test_no_mvp_without_points() {
        let record = Recorder::new(Timer::expired()).finish("1", [0, 0], &[("A".into(), 0.0)]);
        assert_eq!(record.mvp, None);
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.submit(Recorder::new(Timer::expired()).finish("9", [0, 0], &[]));

        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let path = std::env::temp_dir().join(format!("flagship-record-{}.jsonl", unix_millis()));
        let sink = JsonLinesSink::new(&path);
        let record = Recorder::new(Timer::expired()).finish("4321", [1, 0], &[]);

        JsonLinesSink::append(&path, &record).unwrap();
        JsonLinesSink::append(&path, &record).unwrap();
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: SessionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.lobby, "4321");

        let _ = std::fs::remove_file(&path);
    }
}
