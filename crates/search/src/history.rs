/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Tag mutations and their history: bulk add/remove of tag keywords over
//! a target id set, with the applied operations recorded under a
//! human-friendly id so they can be undone or redone. The log lives in a
//! ring of reserved slots in the search record store; each entry carries
//! its own id so a recycled slot cannot satisfy a stale lookup.

use crate::{
    engine::{HISTORY_SLOTS, IDX_HISTORY_MIN, SearchEngine},
    intset::IntSet,
};
use utils::codec::dumb::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOp {
    Add,
    Remove,
}

impl TagOp {
    fn invert(self) -> Self {
        match self {
            TagOp::Add => TagOp::Remove,
            TagOp::Remove => TagOp::Add,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            TagOp::Add => "+",
            TagOp::Remove => "-",
        }
    }

    fn from_symbol(symbol: &str) -> trc::Result<Self> {
        match symbol {
            "+" => Ok(TagOp::Add),
            "-" => Ok(TagOp::Remove),
            _ => Err(trc::StoreEvent::DataCorruption
                .caused_by(trc::location!())
                .details("unknown tag operation")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMutation {
    pub targets: IntSet,
    pub ops: Vec<(TagOp, String)>,
}

impl TagMutation {
    fn to_value(&self) -> trc::Result<Value> {
        Ok(Value::Tuple(vec![
            Value::List(
                self.targets
                    .iter()
                    .map(|id| Value::Int(id as i64))
                    .collect(),
            ),
            Value::List(
                self.ops
                    .iter()
                    .map(|(op, keyword)| {
                        Value::Tuple(vec![
                            Value::Text(op.symbol().to_string()),
                            Value::Text(keyword.clone()),
                        ])
                    })
                    .collect(),
            ),
        ]))
    }

    fn from_value(value: &Value) -> trc::Result<Self> {
        let (Value::Tuple(fields) | Value::List(fields)) = value else {
            return Err(malformed());
        };
        let [targets, ops] = fields.as_slice() else {
            return Err(malformed());
        };
        let (Value::List(target_ids) | Value::Tuple(target_ids)) = targets else {
            return Err(malformed());
        };
        let targets: IntSet = target_ids
            .iter()
            .map(|id| id.as_int().map(|id| id as u32).ok_or_else(malformed))
            .collect::<trc::Result<_>>()?;
        let (Value::List(ops) | Value::Tuple(ops)) = ops else {
            return Err(malformed());
        };
        let ops = ops
            .iter()
            .map(|op| {
                let (Value::Tuple(pair) | Value::List(pair)) = op else {
                    return Err(malformed());
                };
                let [symbol, keyword] = pair.as_slice() else {
                    return Err(malformed());
                };
                Ok((
                    TagOp::from_symbol(symbol.as_str().ok_or_else(malformed)?)?,
                    keyword.as_str().ok_or_else(malformed)?.to_string(),
                ))
            })
            .collect::<trc::Result<Vec<_>>>()?;
        Ok(TagMutation { targets, ops })
    }

    pub fn inverted(&self) -> Self {
        TagMutation {
            targets: self.targets.clone(),
            ops: self
                .ops
                .iter()
                .map(|(op, keyword)| (op.invert(), keyword.clone()))
                .collect(),
        }
    }
}

fn malformed() -> trc::Error {
    trc::StoreEvent::DataCorruption
        .caused_by(trc::location!())
        .details("malformed history record")
}

fn history_key(id: &str) -> String {
    format!("history/{id}")
}

impl SearchEngine {
    /// Applies tag mutations: each `(op, keyword)` pair merges or
    /// subtracts the target set in the keyword's posting list. Returns
    /// the union of all target sets. With `record_history` the applied
    /// list is stored under that id for later undo/redo.
    pub fn mutate(
        &mut self,
        mutations: &[TagMutation],
        record_history: Option<&str>,
    ) -> trc::Result<IntSet> {
        let mut changed = IntSet::new();
        for mutation in mutations {
            for (op, keyword) in &mutation.ops {
                let mut iset = self.get(keyword)?;
                match op {
                    TagOp::Add => iset |= &mutation.targets,
                    TagOp::Remove => iset -= &mutation.targets,
                }
                self.set_keyword(keyword, &iset)?;
            }
            changed |= &mutation.targets;
        }

        if let Some(id) = record_history {
            let entry = Value::Tuple(vec![
                Value::Text(id.to_string()),
                Value::List(
                    mutations
                        .iter()
                        .map(|m| m.to_value())
                        .collect::<trc::Result<_>>()?,
                ),
            ]);
            let slot = IDX_HISTORY_MIN + self.config.history_next % HISTORY_SLOTS;
            self.config.history_next = self.config.history_next.wrapping_add(1);
            self.records.set(slot, &entry)?;
            self.records.set_key(&history_key(id), slot)?;
            self.persist_config()?;
        }

        trc::event!(
            Search(trc::SearchEvent::Mutation),
            Size = changed.count(),
            Details = record_history.unwrap_or_default().to_string(),
        );
        Ok(changed)
    }

    /// Loads the mutation list recorded under `id`; with `undo` the
    /// operations come back inverted.
    pub fn historic_mutations(&mut self, id: &str, undo: bool) -> trc::Result<Vec<TagMutation>> {
        let missing = || {
            trc::event!(
                Search(trc::SearchEvent::HistoryMissing),
                Id = id.to_string(),
            );
            trc::StoreEvent::NotFound
                .caused_by(trc::location!())
                .ctx(trc::Key::Id, id.to_string())
        };
        let entry: Value = self
            .records
            .get_by_key(&history_key(id))?
            .ok_or_else(missing)?;
        let (Value::Tuple(fields) | Value::List(fields)) = &entry else {
            return Err(malformed());
        };
        let [stored_id, mutations] = fields.as_slice() else {
            return Err(malformed());
        };
        // The ring may have recycled this slot for a newer entry.
        if stored_id.as_str() != Some(id) {
            return Err(missing());
        }
        let (Value::List(mutations) | Value::Tuple(mutations)) = mutations else {
            return Err(malformed());
        };
        mutations
            .iter()
            .map(|value| {
                TagMutation::from_value(value)
                    .map(|m| if undo { m.inverted() } else { m })
            })
            .collect()
    }

    pub fn undo(&mut self, id: &str) -> trc::Result<IntSet> {
        let mutations = self.historic_mutations(id, true)?;
        self.mutate(&mutations, None)
    }

    pub fn redo(&mut self, id: &str) -> trc::Result<IntSet> {
        let mutations = self.historic_mutations(id, false)?;
        self.mutate(&mutations, None)
    }
}
