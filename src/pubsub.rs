// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// The in-process publish/subscribe engine.
///
/// Two indexes answer a publication: exact channel bytes, and a linear
/// scan over pattern subscriptions whose matcher decides. Deliveries are
/// scheduled through the defer FIFO and carry a per-subscription
/// sequence number, so a subscriber observes publications in publish
/// order no matter which thread drains the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use global::Uuid;
use loop_msg::Task;
use runtime::Runtime;

/// Decides whether `channel` falls under `pattern`.
pub type MatchFn = fn(&[u8], &[u8]) -> bool;

/// A publication as seen by subscribers. Shared between deliveries; the
/// metadata slot caches pre-encoded renditions (keyed by filter tag) so
/// a wide fan-out pays the encoding once.
pub struct Message {
    pub channel: Vec<u8>,
    pub payload: Vec<u8>,
    pub filter: u64,
    /// Pid of the publishing process, zero when relayed off the bus.
    pub origin: u32,
    meta: Mutex<Vec<(u64, Arc<Vec<u8>>)>>
}

impl Message {
    pub fn new(channel: Vec<u8>, payload: Vec<u8>, filter: u64, origin: u32) -> Message {
        Message {
            channel: channel,
            payload: payload,
            filter: filter,
            origin: origin,
            meta: Mutex::new(Vec::new())
        }
    }

    pub fn meta(&self, key: u64) -> Option<Arc<Vec<u8>>> {
        let meta = self.meta.lock().unwrap();

        meta.iter().find(|e| e.0 == key).map(|e| e.1.clone())
    }

    /// First writer wins; returns what ended up cached.
    pub fn set_meta(&self, key: u64, value: Arc<Vec<u8>>) -> Arc<Vec<u8>> {
        let mut meta = self.meta.lock().unwrap();

        if let Some(existing) = meta.iter().find(|e| e.0 == key) {
            return existing.1.clone();
        }
        meta.push((key, value.clone()));
        value
    }
}

/// Arguments for [`Runtime::subscribe`](struct.Runtime.html#method.subscribe).
pub struct Subscribe {
    /// Exact channel bytes, or the pattern when a matcher is given.
    pub channel: Vec<u8>,
    pub matcher: Option<MatchFn>,
    pub on_message: Box<FnMut(&Runtime, &Arc<Message>) + Send>,
    pub on_unsubscribe: Option<Box<FnMut(&Runtime) + Send>>,
    /// Non-zero restricts delivery to publications carrying this tag.
    pub filter: u64,
    /// Owning connection; the subscription dies with it.
    pub owner: Option<Uuid>
}

pub struct SubEntry {
    pub on_message: Box<FnMut(&Runtime, &Arc<Message>) + Send>,
    pub on_unsubscribe: Option<Box<FnMut(&Runtime) + Send>>,
    pub owner: Option<Uuid>,
    pub dead: bool,
    pub seq_done: u64
}

struct SubRec {
    entry: Arc<Mutex<SubEntry>>,
    channel: Vec<u8>,
    matcher: Option<MatchFn>,
    filter: u64,
    seq_issued: u64
}

struct EngineInner {
    channels: HashMap<Vec<u8>, Vec<u64>>,
    patterns: Vec<u64>,
    subs: HashMap<u64, SubRec>,
    next_id: u64
}

pub struct Engine {
    inner: Mutex<EngineInner>
}

/// What a subscription change means for the rest of the cluster.
#[derive(Debug, PartialEq, Eq)]
pub enum RefChange {
    /// First local subscription for these channel bytes.
    First,
    /// Last one is gone.
    Last,
    None
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            inner: Mutex::new(EngineInner {
                channels: HashMap::new(),
                patterns: Vec::new(),
                subs: HashMap::new(),
                next_id: 1
            })
        }
    }

    pub fn subscribe(&self, args: Subscribe) -> (u64, RefChange) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;

        inner.next_id += 1;

        let entry = Arc::new(Mutex::new(SubEntry {
            on_message: args.on_message,
            on_unsubscribe: args.on_unsubscribe,
            owner: args.owner,
            dead: false,
            seq_done: 0
        }));
        let pattern = args.matcher.is_some();
        let change = if pattern {
            inner.patterns.push(id);
            let channel = &args.channel;
            if inner.subs.values().any(|r| r.matcher.is_some() && r.channel == *channel) {
                RefChange::None
            } else {
                RefChange::First
            }
        } else {
            let ids = inner.channels.entry(args.channel.clone()).or_insert_with(Vec::new);

            ids.push(id);
            if ids.len() == 1 { RefChange::First } else { RefChange::None }
        };

        inner.subs.insert(id, SubRec {
            entry: entry,
            channel: args.channel,
            matcher: args.matcher,
            filter: args.filter,
            seq_issued: 0
        });

        (id, change)
    }

    /// Detaches the subscription from the indexes. The caller still has
    /// to mark the entry dead (see [`retire`](fn.retire.html)); pending
    /// deliveries observe the mark and drop the message. Returns the
    /// entry, its channel, whether it was a pattern, and whether this
    /// was the channel's last local subscription.
    pub fn unsubscribe(&self, id: u64)
        -> Option<(Arc<Mutex<SubEntry>>, Vec<u8>, bool, RefChange)> {
        let mut inner = self.inner.lock().unwrap();
        let rec = match inner.subs.remove(&id) {
            Some(rec) => rec,
            None => return None
        };

        if rec.matcher.is_some() {
            inner.patterns.retain(|&p| p != id);
        } else if let Some(ids) = inner.channels.get_mut(&rec.channel) {
            ids.retain(|&s| s != id);
        }

        let emptied = if rec.matcher.is_some() {
            !inner.subs.values().any(|r| r.matcher.is_some() && r.channel == rec.channel)
        } else {
            let emptied = inner.channels.get(&rec.channel).map(|ids| ids.is_empty()).unwrap_or(false);

            if emptied {
                inner.channels.remove(&rec.channel);
            }
            emptied
        };
        let change = if emptied { RefChange::Last } else { RefChange::None };

        Some((rec.entry, rec.channel, rec.matcher.is_some(), change))
    }

    /// Schedules one delivery task per matching subscription, in index
    /// order, each stamped with the subscription's next sequence number.
    pub fn fanout(&self, rt: &Runtime, msg: Arc<Message>) {
        let deliveries = {
            let mut inner = self.inner.lock().unwrap();
            let mut ids: Vec<u64> = Vec::new();

            if let Some(exact) = inner.channels.get(&msg.channel) {
                ids.extend_from_slice(exact);
            }
            for &id in inner.patterns.iter() {
                let matched = inner.subs.get(&id)
                    .map(|r| (r.matcher.unwrap())(&msg.channel, &r.channel))
                    .unwrap_or(false);

                if matched {
                    ids.push(id);
                }
            }

            let mut out = Vec::with_capacity(ids.len());

            for id in ids {
                if let Some(rec) = inner.subs.get_mut(&id) {
                    if rec.filter != 0 && rec.filter != msg.filter {
                        continue;
                    }
                    rec.seq_issued += 1;
                    out.push((rec.entry.clone(), rec.seq_issued));
                }
            }
            out
        };

        for (entry, seq) in deliveries {
            rt.push_task(Task::Deliver { sub: entry, seq: seq, msg: msg.clone() });
        }
    }
}

/// Marks a detached entry dead and schedules its cleanup hook. The
/// entry lock is only tried: a subscription unsubscribing itself from
/// its own callback already holds it, so the marking is deferred then.
pub fn retire(rt: &Runtime, entry: Arc<Mutex<SubEntry>>) {
    let deferred = match entry.try_lock() {
        Ok(mut guard) => {
            guard.dead = true;
            guard.on_unsubscribe.take()
        }
        Err(_) => {
            let again = entry.clone();

            rt.push_task(Task::Fn(Box::new(move |rt: &Runtime| {
                retire(rt, again.clone());
            })));
            return;
        }
    };

    if let Some(mut hook) = deferred {
        rt.push_task(Task::Fn(Box::new(move |rt: &Runtime| {
            hook(rt);
        })));
    }
}

/// Runs one scheduled delivery. Out-of-turn deliveries go back to the
/// FIFO until the earlier publication for the same subscription ran.
pub fn deliver(rt: &Runtime, sub: Arc<Mutex<SubEntry>>, seq: u64, msg: Arc<Message>) {
    let again = {
        let mut entry = sub.lock().unwrap();

        if entry.dead {
            return;
        }
        if entry.seq_done + 1 == seq {
            entry.seq_done = seq;
            (entry.on_message)(rt, &msg);
            false
        } else {
            true
        }
    };

    if again {
        rt.push_task(Task::Deliver { sub: sub, seq: seq, msg: msg });
    }
}

/// The default pattern matcher: `*` spans anything, `?` eats one byte,
/// `[a-z]` and `[^a-z]` match classes, `\` escapes the next byte.
pub fn glob_match(channel: &[u8], pattern: &[u8]) -> bool {
    glob_step(channel, pattern)
}

fn glob_step(mut text: &[u8], mut pat: &[u8]) -> bool {
    while !pat.is_empty() {
        match pat[0] {
            b'*' => {
                while pat.first() == Some(&b'*') {
                    pat = &pat[1..];
                }
                if pat.is_empty() {
                    return true;
                }
                for start in 0..text.len() + 1 {
                    if glob_step(&text[start..], pat) {
                        return true;
                    }
                }
                return false;
            }
            b'?' => {
                if text.is_empty() {
                    return false;
                }
                text = &text[1..];
                pat = &pat[1..];
            }
            b'[' => {
                let (matched, rest) = match glob_class(text.first().cloned(), &pat[1..]) {
                    Some(step) => step,
                    None => return false
                };

                if !matched {
                    return false;
                }
                text = &text[1..];
                pat = rest;
            }
            b'\\' if pat.len() > 1 => {
                if text.first() != Some(&pat[1]) {
                    return false;
                }
                text = &text[1..];
                pat = &pat[2..];
            }
            c => {
                if text.first() != Some(&c) {
                    return false;
                }
                text = &text[1..];
                pat = &pat[1..];
            }
        }
    }

    text.is_empty()
}

// returns (byte matched the class, pattern after the closing bracket)
fn glob_class(byte: Option<u8>, mut pat: &[u8]) -> Option<(bool, &[u8])> {
    let byte = match byte {
        Some(b) => b,
        None => return None
    };
    let negated = pat.first() == Some(&b'^');

    if negated {
        pat = &pat[1..];
    }

    let mut matched = false;
    let mut first = true;

    loop {
        match pat.first() {
            None => return None,
            Some(&b']') if !first => {
                return Some((matched != negated, &pat[1..]));
            }
            Some(&lo) => {
                first = false;
                if pat.len() >= 3 && pat[1] == b'-' && pat[2] != b']' {
                    if lo <= byte && byte <= pat[2] {
                        matched = true;
                    }
                    pat = &pat[3..];
                } else {
                    if lo == byte {
                        matched = true;
                    }
                    pat = &pat[1..];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn glob_literals_and_stars() {
        assert!(glob_match(b"chat", b"chat"));
        assert!(!glob_match(b"chat", b"chats"));
        assert!(glob_match(b"chat.room.1", b"chat.*"));
        assert!(glob_match(b"chat", b"*"));
        assert!(glob_match(b"", b"*"));
        assert!(!glob_match(b"room.chat", b"chat.*"));
        assert!(glob_match(b"a.b.c", b"a.*.c"));
    }

    #[test]
    fn glob_question_marks() {
        assert!(glob_match(b"room1", b"room?"));
        assert!(!glob_match(b"room", b"room?"));
        assert!(glob_match(b"room42", b"room??"));
    }

    #[test]
    fn glob_classes() {
        assert!(glob_match(b"room1", b"room[0-9]"));
        assert!(!glob_match(b"roomx", b"room[0-9]"));
        assert!(glob_match(b"roomx", b"room[^0-9]"));
        assert!(glob_match(b"roomb", b"room[abc]"));
    }

    #[test]
    fn glob_escapes() {
        assert!(glob_match(b"a*b", b"a\\*b"));
        assert!(!glob_match(b"axb", b"a\\*b"));
    }
}
