//! 问题生命周期状态机
//!
//! Received → Matching → Hit → Replaying → {Succeeded | Failed | LiveReasoning（回退）}
//!                     → Miss → LiveReasoning → {Succeeded → Generalizing → {Cached | DiscardedSilently} | Failed}

use serde::Serialize;
use thiserror::Error;

/// 问题所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionPhase {
    Received,
    Matching,
    Hit,
    Miss,
    Replaying,
    LiveReasoning,
    Succeeded,
    Failed,
    Generalizing,
    Cached,
    DiscardedSilently,
}

impl QuestionPhase {
    /// 回答路径的终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, QuestionPhase::Succeeded | QuestionPhase::Failed)
    }

    fn allows(&self, next: QuestionPhase) -> bool {
        use QuestionPhase::*;
        matches!(
            (self, next),
            (Received, Matching)
                | (Matching, Hit)
                | (Matching, Miss)
                | (Hit, Replaying)
                | (Replaying, Succeeded)
                | (Replaying, Failed)
                | (Replaying, LiveReasoning)
                | (Miss, LiveReasoning)
                | (LiveReasoning, Succeeded)
                | (LiveReasoning, Failed)
                | (Succeeded, Generalizing)
                | (Generalizing, Cached)
                | (Generalizing, DiscardedSilently)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal phase transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: QuestionPhase,
    pub to: QuestionPhase,
}

/// 生命周期记录：只接受合法转移
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuestionLifecycle {
    history: Vec<QuestionPhase>,
}

impl Default for QuestionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl QuestionLifecycle {
    pub fn new() -> Self {
        Self {
            history: vec![QuestionPhase::Received],
        }
    }

    pub fn current(&self) -> QuestionPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(QuestionPhase::Received)
    }

    pub fn advance(&mut self, next: QuestionPhase) -> Result<(), IllegalTransition> {
        let from = self.current();
        // 只有实时推理得到的成功结果才进入学习
        let learnable = next != QuestionPhase::Generalizing
            || self.history.contains(&QuestionPhase::LiveReasoning);
        if !from.allows(next) || !learnable {
            return Err(IllegalTransition { from, to: next });
        }
        self.history.push(next);
        Ok(())
    }

    pub fn history(&self) -> &[QuestionPhase] {
        &self.history
    }

    /// 是否经历过某阶段
    pub fn visited(&self, phase: QuestionPhase) -> bool {
        self.history.contains(&phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use QuestionPhase::*;

    #[test]
    fn test_hit_path() {
        let mut lc = QuestionLifecycle::new();
        for p in [Matching, Hit, Replaying, Succeeded] {
            lc.advance(p).unwrap();
        }
        assert!(lc.current().is_terminal());
        // 回放成功不学习
        assert!(lc.advance(Generalizing).is_err());
    }

    #[test]
    fn test_miss_and_fallback_paths() {
        let mut lc = QuestionLifecycle::new();
        for p in [Matching, Hit, Replaying, LiveReasoning, Succeeded, Generalizing, Cached] {
            lc.advance(p).unwrap();
        }
        assert!(lc.visited(LiveReasoning));

        let mut lc = QuestionLifecycle::new();
        lc.advance(Matching).unwrap();
        lc.advance(Miss).unwrap();
        assert_eq!(
            lc.advance(Replaying),
            Err(IllegalTransition { from: Miss, to: Replaying })
        );
    }
}
