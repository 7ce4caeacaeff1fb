//! A tiny headless card game used by `spirebridge run`.
//!
//! It stands in for a real host so the binary can exercise the advisor
//! handshake, command routing and viewer broadcast end to end. Commands:
//! `state`, `play <n|card>` (1-based hand index or card id), `end`.

use serde::Serialize;

use crate::bridge::{CommandError, CommandExecutor, StateSerializer};

const TURN_ENERGY: u32 = 3;
const HAND_SIZE: usize = 5;
const ENEMY_HP: i32 = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct Card {
    id: &'static str,
    cost: u32,
    damage: i32,
    block: i32,
}

const DECK: [Card; 3] = [
    Card {
        id: "Strike_R",
        cost: 1,
        damage: 6,
        block: 0,
    },
    Card {
        id: "Defend_R",
        cost: 1,
        damage: 0,
        block: 5,
    },
    Card {
        id: "Bash",
        cost: 2,
        damage: 8,
        block: 0,
    },
];

#[derive(Debug, Serialize)]
struct GameState<'a> {
    turn: u32,
    energy: u32,
    block: i32,
    enemy_hp: i32,
    hand: &'a [Card],
}

#[derive(Debug, Serialize)]
struct StateMessage<'a> {
    ready_for_command: bool,
    in_game: bool,
    game_state: GameState<'a>,
}

#[derive(Debug)]
pub struct DemoGame {
    turn: u32,
    energy: u32,
    block: i32,
    enemy_hp: i32,
    hand: Vec<Card>,
    changed: bool,
}

impl Default for DemoGame {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoGame {
    pub fn new() -> Self {
        let mut game = Self {
            turn: 0,
            energy: 0,
            block: 0,
            enemy_hp: ENEMY_HP,
            hand: Vec::new(),
            changed: true,
        };
        game.start_turn();
        game
    }

    fn start_turn(&mut self) {
        self.turn += 1;
        self.energy = TURN_ENERGY;
        self.block = 0;
        // Deterministic rotation through the deck.
        let offset = self.turn as usize;
        self.hand = (0..HAND_SIZE)
            .map(|slot| DECK[(offset + slot) % DECK.len()])
            .collect();
    }

    pub fn is_over(&self) -> bool {
        self.enemy_hp <= 0
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    /// Resolve a 1-based index or a card id to a hand position.
    fn find_card(&self, target: &str) -> Result<usize, CommandError> {
        if let Ok(index) = target.parse::<usize>() {
            if (1..=self.hand.len()).contains(&index) {
                return Ok(index - 1);
            }
            return Err(CommandError::InvalidArgument(format!(
                "no card at index {index} (hand has {})",
                self.hand.len()
            )));
        }
        self.hand
            .iter()
            .position(|card| card.id.eq_ignore_ascii_case(target))
            .ok_or_else(|| CommandError::InvalidArgument(format!("{target} is not in hand")))
    }

    fn play(&mut self, target: &str) -> Result<bool, CommandError> {
        let position = self.find_card(target)?;
        let card = self.hand[position];
        if card.cost > self.energy {
            return Err(CommandError::Unavailable(format!(
                "{} costs {} but only {} energy left",
                card.id, card.cost, self.energy
            )));
        }
        self.hand.remove(position);
        self.energy -= card.cost;
        self.enemy_hp -= card.damage;
        self.block += card.block;
        Ok(true)
    }
}

impl StateSerializer for DemoGame {
    fn serialize(&self) -> String {
        let message = StateMessage {
            ready_for_command: self.ready_for_command(),
            in_game: !self.is_over(),
            game_state: GameState {
                turn: self.turn,
                energy: self.energy,
                block: self.block,
                enemy_hp: self.enemy_hp.max(0),
                hand: &self.hand,
            },
        };
        // Plain structs of strings and integers always serialize.
        serde_json::to_string(&message).unwrap_or_default()
    }

    fn take_state_change(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

impl CommandExecutor for DemoGame {
    fn execute(&mut self, command: &str) -> Result<bool, CommandError> {
        let mut words = command.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(CommandError::Unknown(String::new()));
        };
        let verb = verb.to_ascii_lowercase();
        if self.is_over() && verb != "state" {
            return Err(CommandError::Unavailable("the fight is over".to_string()));
        }
        match verb.as_str() {
            "state" => Ok(true),
            "play" => {
                let target = words
                    .next()
                    .ok_or_else(|| CommandError::InvalidArgument("play needs a card".to_string()))?;
                self.play(target)
            }
            "end" => {
                self.start_turn();
                Ok(true)
            }
            _ => Err(CommandError::Unknown(verb)),
        }
    }

    fn ready_for_command(&self) -> bool {
        !self.is_over()
    }
}
