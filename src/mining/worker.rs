//! Out-of-process nonce search.
//!
//! The node re-executes its own binary with the `miner` argument; IPC is one
//! JSON line in on stdin (the job) and at most one JSON line out on stdout
//! (the solution). The parent preempts by killing the child; exit code 0 is
//! a normal or natural end, anything else is a crash.

use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::block::{big_hex, ParentBlock, Solution};
use crate::chains::ChildHeader;
use crate::engine::EngineEvent;
use crate::errors::{NodeResult, WorkerError};
use crate::hashing::blake2bl;
use crate::mining::difficulty::{get_diff, get_exp_factor_diff};
use crate::mining::work::distance;

/// Hard self-timeout for a single search.
const SEARCH_DEADLINE: Duration = Duration::from_secs(300);

/// Everything the worker needs to re-derive difficulty on each wall second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifficultyData {
    pub current_timestamp: u64,
    pub previous_block: ParentBlock,
    pub new_headers: Vec<ChildHeader>,
    #[serde(with = "big_hex")]
    pub minimum_difficulty: BigUint,
}

/// The single request sent to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    /// Unix seconds at assembly.
    pub current_timestamp: u64,
    pub offset_ms: i64,
    pub work: String,
    pub miner_key: String,
    pub merkle_root: String,
    #[serde(with = "big_hex")]
    pub difficulty: BigUint,
    pub difficulty_data: DifficultyData,
}

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn recompute_difficulty(data: &DifficultyData, current_s: u64) -> BigUint {
    let pre = get_diff(
        current_s * 1000,
        data.previous_block.timestamp * 1000,
        &data.previous_block.difficulty,
        &data.minimum_difficulty,
        data.new_headers.len() as u64,
    );
    get_exp_factor_diff(pre, data.previous_block.height)
}

/// The search loop. Returns `None` on deadline.
pub fn search(job: &WorkerJob) -> Option<Solution> {
    let started = Instant::now();
    let mut iterations: u64 = 0;
    let mut current_s = job.current_timestamp;
    let mut difficulty = job.difficulty.clone();
    let mut rng = rand::thread_rng();

    loop {
        if started.elapsed() >= SEARCH_DEADLINE {
            return None;
        }

        let now_s = wall_ms().saturating_add_signed(job.offset_ms) / 1000;
        if now_s > current_s {
            current_s = now_s;
            difficulty = recompute_difficulty(&job.difficulty_data, current_s);
        }

        let nonce = format!("{}", rng.gen::<f64>());
        let trial = distance(
            &job.work,
            &blake2bl(&format!(
                "{}{}{}{}",
                job.miner_key,
                job.merkle_root,
                blake2bl(&nonce),
                current_s
            )),
        );
        iterations += 1;

        if trial > difficulty {
            return Some(Solution {
                nonce,
                distance: trial,
                timestamp: current_s,
                difficulty,
                iterations,
                time_diff_ms: started.elapsed().as_millis() as u64,
            });
        }
    }
}

/// Entry point of the `miner` subcommand. Reads the job from stdin, runs the
/// search, writes the solution (if any) to stdout. The process exit code is
/// returned.
pub fn run_worker() -> i32 {
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return 2;
    }
    let job: WorkerJob = match serde_json::from_str(line.trim()) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("[WORKER] bad job payload: {}", e);
            return 2;
        }
    };

    match search(&job) {
        Some(solution) => match serde_json::to_string(&solution) {
            Ok(out) => {
                println!("{}", out);
                0
            }
            Err(_) => 2,
        },
        None => 0, // deadline; the engine treats silence as a timeout
    }
}

/// Parent-side handle to a running worker process.
pub struct WorkerHandle {
    cancel: oneshot::Sender<()>,
}

impl WorkerHandle {
    /// Fork a worker and feed it the job. Solutions and exits come back on
    /// the engine's event queue.
    pub fn spawn(
        job: &WorkerJob,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> NodeResult<WorkerHandle> {
        let exe = std::env::current_exe()
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
        let mut child = Command::new(exe)
            .arg("miner")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Ipc("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Ipc("worker stdout unavailable".into()))?;
        let payload = serde_json::to_vec(job)?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            if stdin.write_all(&payload).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                tracing::warn!("[WORKER] failed to deliver job");
            }

            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        // Preemption: close IPC and kill, fire-and-forget.
                        drop(stdin);
                        let _ = child.kill().await;
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(raw)) if !raw.trim().is_empty() => {
                            match serde_json::from_str::<Solution>(raw.trim()) {
                                Ok(solution) => {
                                    let _ = events.send(EngineEvent::WorkerSolution(solution));
                                }
                                Err(e) => {
                                    tracing::warn!(err = %e, "[WORKER] undecodable message");
                                }
                            }
                        }
                        Ok(Some(_)) => {}
                        _ => {
                            let code = child.wait().await.ok().and_then(|s| s.code());
                            let _ = events.send(EngineEvent::WorkerExit { code });
                            break;
                        }
                    }
                }
            }
        });

        Ok(WorkerHandle { cancel: cancel_tx })
    }

    /// Stop the worker: disconnect IPC and kill the process. Does not block.
    pub fn stop(self) {
        let _ = self.cancel.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_support::test_block;
    use crate::mining::difficulty::minimum_difficulty;
    use crate::mining::work::prepare_work;

    fn job_with_difficulty(difficulty: BigUint) -> WorkerJob {
        let previous = test_block(1, &"0".repeat(64), 1, 1);
        let work = prepare_work(&previous.hash, &previous.blockchain_headers);
        WorkerJob {
            current_timestamp: previous.timestamp + 6,
            offset_ms: 0,
            work,
            miner_key: "0xminer".to_string(),
            merkle_root: blake2bl("candidate-merkle"),
            difficulty: difficulty.clone(),
            difficulty_data: DifficultyData {
                current_timestamp: previous.timestamp + 6,
                previous_block: previous,
                new_headers: Vec::new(),
                minimum_difficulty: difficulty,
            },
        }
    }

    #[test]
    fn trivial_difficulty_finds_a_solution() {
        // Distance is always positive for distinct digests, so a zero
        // threshold is beaten on the first draw.
        let job = job_with_difficulty(BigUint::from(0u8));
        let solution = search(&job).expect("solution");
        assert!(solution.distance > solution.difficulty);
        assert!(solution.iterations >= 1);
        assert!(!solution.nonce.is_empty());
    }

    #[test]
    fn solution_round_trips_as_json() {
        let job = job_with_difficulty(BigUint::from(0u8));
        let solution = search(&job).expect("solution");
        let line = serde_json::to_string(&solution).expect("encode");
        let back: Solution = serde_json::from_str(&line).expect("decode");
        assert_eq!(back.nonce, solution.nonce);
        assert_eq!(back.distance, solution.distance);
    }

    #[test]
    fn job_round_trips_as_json() {
        let job = job_with_difficulty(minimum_difficulty());
        let line = serde_json::to_string(&job).expect("encode");
        let back: WorkerJob = serde_json::from_str(&line).expect("decode");
        assert_eq!(back.work, job.work);
        assert_eq!(back.difficulty, job.difficulty);
        assert_eq!(
            back.difficulty_data.previous_block.hash,
            job.difficulty_data.previous_block.hash
        );
    }

    #[test]
    fn recompute_tracks_wall_second() {
        let job = job_with_difficulty(minimum_difficulty());
        let d1 = recompute_difficulty(&job.difficulty_data, job.current_timestamp);
        let d2 = recompute_difficulty(&job.difficulty_data, job.current_timestamp + 60);
        assert!(d2 <= d1, "later seconds must not raise difficulty");
    }
}
