// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Channel list reconciliation between what a source supports and what its
//! definition asks for.

use rwcommon::config::SourceDefinition;

/// Result of merging the helper-reported channels with the definition
/// options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelPlan {
    /// Everything the source is considered to support.
    pub source_channels: Vec<String>,
    /// What the hop loop will actually walk; empty disables hopping.
    pub hop_channels: Vec<String>,
}

fn contains_ci(list: &[String], chan: &str) -> bool {
    list.iter().any(|c| c.eq_ignore_ascii_case(chan))
}

/// Merge rules, in order:
/// * `channel=` adds a single locked channel to the supported list;
/// * `channels=` replaces the hop list entirely (block list ignored);
/// * otherwise the hop list is the supported list minus `block_channels=`,
///   with `add_channels=` appended unfiltered.
pub fn merge_channels(reported: &[String], definition: &SourceDefinition) -> ChannelPlan {
    let mut source_channels: Vec<String> = reported.to_vec();
    let mut hop_channels: Vec<String> = Vec::new();

    if let Some(chan) = definition.opt("channel") {
        if !chan.is_empty() && !contains_ci(&source_channels, chan) {
            source_channels.push(chan.to_string());
        }
    }

    let override_vec = definition.opt_list("channels");
    let add_vec = definition.opt_list("add_channels");
    let block_vec = definition.opt_list("block_channels");

    if !override_vec.is_empty() {
        for chan in override_vec {
            if !contains_ci(&source_channels, &chan) {
                source_channels.push(chan.clone());
            }
            hop_channels.push(chan);
        }
    } else if !add_vec.is_empty() {
        for chan in &source_channels {
            if !block_vec.iter().any(|b| b.eq_ignore_ascii_case(chan)) {
                hop_channels.push(chan.clone());
            }
        }
        for chan in add_vec {
            if !contains_ci(&source_channels, &chan) {
                hop_channels.push(chan.clone());
                source_channels.push(chan);
            }
        }
    } else {
        for chan in &source_channels {
            if !block_vec.iter().any(|b| b.eq_ignore_ascii_case(chan)) {
                hop_channels.push(chan.clone());
            }
        }
    }

    ChannelPlan {
        source_channels,
        hop_channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(s: &str) -> SourceDefinition {
        s.parse().unwrap()
    }

    fn chans(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_copy() {
        let plan = merge_channels(&chans(&["1", "6", "11"]), &def("wlan0"));
        assert_eq!(plan.source_channels, chans(&["1", "6", "11"]));
        assert_eq!(plan.hop_channels, chans(&["1", "6", "11"]));
    }

    #[test]
    fn test_add_and_block() {
        let plan = merge_channels(
            &chans(&["1", "6", "11"]),
            &def("wlan0:add_channels=\"36,40\",block_channels=6"),
        );
        assert_eq!(plan.source_channels, chans(&["1", "6", "11", "36", "40"]));
        assert_eq!(plan.hop_channels, chans(&["1", "11", "36", "40"]));
    }

    #[test]
    fn test_channels_overrides_and_ignores_blocks() {
        let plan = merge_channels(
            &chans(&["1", "6", "11"]),
            &def("wlan0:channels=\"6,36\",block_channels=6"),
        );
        assert_eq!(plan.hop_channels, chans(&["6", "36"]));
        assert_eq!(plan.source_channels, chans(&["1", "6", "11", "36"]));
    }

    #[test]
    fn test_single_channel_added_to_supported() {
        let plan = merge_channels(&chans(&["1", "6"]), &def("wlan0:channel=36"));
        assert!(plan.source_channels.contains(&"36".to_string()));
        assert_eq!(plan.hop_channels, chans(&["1", "6", "36"]));
    }

    #[test]
    fn test_blocking_everything_disables_hopping() {
        let plan = merge_channels(
            &chans(&["1", "6"]),
            &def("wlan0:block_channels=\"1,6\""),
        );
        assert!(plan.hop_channels.is_empty());
        assert_eq!(plan.source_channels, chans(&["1", "6"]));
    }

    #[test]
    fn test_case_insensitive_matching() {
        let plan = merge_channels(
            &chans(&["36HT40-", "40"]),
            &def("wlan0:block_channels=36ht40-"),
        );
        assert_eq!(plan.hop_channels, chans(&["40"]));
    }
}
