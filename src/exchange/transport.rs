//! Rank-to-rank transport.
//!
//! Every exchange is a symmetric two-phase handshake: both sides first trade
//! payload lengths, then the payloads themselves. Partners must call
//! [`Transport::exchange`] pairwise in the same order; a length that does
//! not match the payload that follows is a fatal protocol error.

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::error::PdError;

pub trait Transport {
    fn rank(&self) -> usize;

    fn n_ranks(&self) -> usize;

    /// Send `payload` to `peer` and receive its payload in return.
    fn exchange(&self, peer: usize, payload: &[f64]) -> Result<Vec<f64>, PdError>;

    /// Global sum over all ranks. Every rank must call this the same number
    /// of times in the same order.
    fn allreduce_sum(&self, value: f64) -> Result<f64, PdError>;
}

/// Trivial transport for a single-rank run. Exchanging with any peer is a
/// protocol violation since no peer exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRank;

impl Transport for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn n_ranks(&self) -> usize {
        1
    }

    fn exchange(&self, peer: usize, _payload: &[f64]) -> Result<Vec<f64>, PdError> {
        Err(PdError::Protocol(format!(
            "exchange with rank {} on a single-rank transport",
            peer
        )))
    }

    fn allreduce_sum(&self, value: f64) -> Result<f64, PdError> {
        Ok(value)
    }
}

/// In-process transport over unbounded channels, one full mesh per
/// simulation. Sends never block, so the pairwise handshake cannot deadlock
/// regardless of the order in which peers post their halves.
pub struct ChannelTransport {
    rank: usize,
    senders: Vec<Option<Sender<Vec<f64>>>>,
    receivers: Vec<Option<Receiver<Vec<f64>>>>,
}

impl ChannelTransport {
    /// Build a fully connected mesh of `n_ranks` transports, one per rank.
    pub fn connect(n_ranks: usize) -> Vec<ChannelTransport> {
        let mut senders: Vec<Vec<Option<Sender<Vec<f64>>>>> =
            (0..n_ranks).map(|_| (0..n_ranks).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Vec<f64>>>>> =
            (0..n_ranks).map(|_| (0..n_ranks).map(|_| None).collect()).collect();

        for from in 0..n_ranks {
            for to in 0..n_ranks {
                if from == to {
                    continue;
                }
                let (tx, rx) = channel();
                senders[from][to] = Some(tx);
                receivers[to][from] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ChannelTransport {
                rank,
                senders,
                receivers,
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn n_ranks(&self) -> usize {
        self.senders.len()
    }

    fn exchange(&self, peer: usize, payload: &[f64]) -> Result<Vec<f64>, PdError> {
        let sender = self
            .senders
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| PdError::Protocol(format!("no link to rank {}", peer)))?;
        let receiver = self
            .receivers
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| PdError::Protocol(format!("no link from rank {}", peer)))?;

        sender
            .send(vec![payload.len() as f64])
            .and_then(|_| sender.send(payload.to_vec()))
            .map_err(|_| PdError::Protocol(format!("rank {} hung up", peer)))?;

        let count = receiver
            .recv()
            .map_err(|_| PdError::Protocol(format!("rank {} hung up", peer)))?;
        if count.len() != 1 {
            return Err(PdError::Protocol(format!(
                "malformed length header from rank {}",
                peer
            )));
        }
        let expected = count[0] as usize;
        let body = receiver
            .recv()
            .map_err(|_| PdError::Protocol(format!("rank {} hung up", peer)))?;
        if body.len() != expected {
            return Err(PdError::Protocol(format!(
                "rank {} announced {} values but sent {}",
                peer,
                expected,
                body.len()
            )));
        }
        Ok(body)
    }

    fn allreduce_sum(&self, value: f64) -> Result<f64, PdError> {
        let mut total = value;
        for peer in 0..self.n_ranks() {
            if peer == self.rank {
                continue;
            }
            let got = self.exchange(peer, &[value])?;
            if got.len() != 1 {
                return Err(PdError::Protocol(format!(
                    "malformed reduction contribution from rank {}",
                    peer
                )));
            }
            total += got[0];
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairwise_exchange_across_threads() {
        let mut mesh = ChannelTransport::connect(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        let handle = std::thread::spawn(move || t1.exchange(0, &[3.0, 4.0]).unwrap());
        let got0 = t0.exchange(1, &[1.0, 2.0]).unwrap();
        let got1 = handle.join().unwrap();

        assert_eq!(got0, vec![3.0, 4.0]);
        assert_eq!(got1, vec![1.0, 2.0]);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let mut mesh = ChannelTransport::connect(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        let handle = std::thread::spawn(move || t1.exchange(0, &[]).unwrap());
        assert!(t0.exchange(1, &[]).unwrap().is_empty());
        assert!(handle.join().unwrap().is_empty());
    }

    #[test]
    fn test_single_rank_rejects_peers() {
        assert!(SingleRank.exchange(1, &[0.0]).is_err());
        assert_eq!(SingleRank.allreduce_sum(2.5).unwrap(), 2.5);
    }

    #[test]
    fn test_allreduce_sums_across_ranks() {
        let mut mesh = ChannelTransport::connect(3);
        let handles: Vec<_> = mesh
            .drain(..)
            .enumerate()
            .map(|(rank, t)| {
                std::thread::spawn(move || t.allreduce_sum(rank as f64 + 1.0).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 6.0);
        }
    }
}
