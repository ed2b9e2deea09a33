use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Header positions of the 40-pin Raspberry Pi connector that carry a GPIO,
/// paired with the BCM line behind them.
const RASPBERRY_PI_HEADER: [(u32, u32); 28] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (27, 0),
    (28, 1),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

/// Mapping from board header positions to logical pin numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinLayout {
    board_to_logical: FxHashMap<u32, u32>,
}

impl PinLayout {
    pub fn new<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        Self {
            board_to_logical: pairs.into_iter().collect(),
        }
    }

    pub fn raspberry_pi() -> Self {
        Self::new(RASPBERRY_PI_HEADER)
    }

    pub fn to_logical(&self, board_pin: u32) -> Option<u32> {
        self.board_to_logical.get(&board_pin).copied()
    }

    pub fn to_board(&self, logical_pin: u32) -> Option<u32> {
        self.board_to_logical
            .iter()
            .find(|(_, logical)| **logical == logical_pin)
            .map(|(board, _)| *board)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.board_to_logical.iter().map(|(b, l)| (*b, *l))
    }

    pub fn len(&self) -> usize {
        self.board_to_logical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.board_to_logical.is_empty()
    }
}
