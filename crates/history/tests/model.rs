//! Differential test against a plain in-memory tree model
//!
//! Random sequences of advance/undo/redo/save run against both the real
//! history (attached, radius 1, so eviction and reload paths fire
//! constantly) and a naive tree that keeps everything in memory. After
//! every operation the current payload and stratum must agree, and at the
//! end the full undo chain must replay identically.

use proptest::prelude::*;
use snaptree_core::I32Codec;
use snaptree_history::History;
use snaptree_storage::Stage;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Advance(i32),
    Undo,
    Redo(usize),
    Save,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<i32>().prop_map(Op::Advance),
        2 => Just(Op::Undo),
        2 => (0usize..4).prop_map(Op::Redo),
        1 => Just(Op::Save),
    ]
}

struct ModelNode {
    state: i32,
    parent: Option<usize>,
    children: Vec<usize>,
}

struct Model {
    nodes: Vec<ModelNode>,
    current: usize,
}

impl Model {
    fn new(state: i32) -> Self {
        Model {
            nodes: vec![ModelNode {
                state,
                parent: None,
                children: Vec::new(),
            }],
            current: 0,
        }
    }

    fn state(&self) -> i32 {
        self.nodes[self.current].state
    }

    fn stratum(&self) -> u64 {
        let mut depth = 0;
        let mut k = self.current;
        while let Some(p) = self.nodes[k].parent {
            depth += 1;
            k = p;
        }
        depth
    }

    fn advance(&mut self, state: i32) {
        let key = self.nodes.len();
        self.nodes.push(ModelNode {
            state,
            parent: Some(self.current),
            children: Vec::new(),
        });
        self.nodes[self.current].children.push(key);
        self.current = key;
    }

    fn undo(&mut self) {
        self.current = self.nodes[self.current].parent.expect("not at root");
    }

    fn redo(&mut self, child_index: usize) {
        self.current = self.nodes[self.current].children[child_index];
    }

    fn undo_chain(&self) -> Vec<i32> {
        let mut states = vec![self.state()];
        let mut k = self.current;
        while let Some(p) = self.nodes[k].parent {
            states.push(self.nodes[p].state);
            k = p;
        }
        states
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn history_matches_reference_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = TempDir::new().unwrap();
        let stage = Arc::new(Stage::open(dir.path().join("model.stage"), true).unwrap());
        let mut history = History::attached(0, stage, Box::new(I32Codec));
        let mut model = Model::new(0);

        for op in ops {
            match op {
                Op::Advance(v) => {
                    history.advance(v).unwrap();
                    model.advance(v);
                }
                Op::Undo => {
                    if history.stratum() > 0 {
                        history.undo().unwrap();
                        model.undo();
                    } else {
                        prop_assert!(history.undo().is_err());
                    }
                }
                Op::Redo(k) => {
                    let links = history.children_of(history.current()).unwrap();
                    if links.is_empty() {
                        continue;
                    }
                    let i = k % links.len();
                    // redo through resident children; following a pure
                    // chunk id may land on a superseded chunk version,
                    // which the naive model cannot represent
                    let Some(r) = links[i].snapshot else { continue };
                    history.redo_to(r).unwrap();
                    model.redo(i);
                }
                Op::Save => {
                    history.save().unwrap();
                }
            }
            prop_assert_eq!(*history.state(), model.state());
            prop_assert_eq!(history.stratum(), model.stratum());
        }

        // the full backward replay agrees
        let mut replay = vec![*history.state()];
        while history.stratum() > 0 {
            history.undo().unwrap();
            replay.push(*history.state());
        }
        prop_assert_eq!(replay, model.undo_chain());
    }
}
