//! Bootstrap-list parsing: space-separated `phy:vif` tokens.

pub struct BootstrapEntry {
    pub phy_name: String,
    pub vif_name: String,
}

pub fn gre_name_for(vif_name: &str) -> String {
    format!("g-{vif_name}")
}

pub fn parse_list(list: &str) -> Vec<BootstrapEntry> {
    list.split(' ')
        .filter_map(|entry| {
            // First two :-delimited fields; anything after the second
            // colon is dropped.
            let mut it = entry.split(':');
            let phy_name = it.next()?;
            let vif_name = it.next()?;
            if phy_name.is_empty() || vif_name.is_empty() {
                return None;
            }
            Some(BootstrapEntry {
                phy_name: phy_name.to_string(),
                vif_name: vif_name.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phy_vif_pairs() {
        let entries = parse_list("phy0:bhaul-sta-24 phy1:bhaul-sta-5");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phy_name, "phy0");
        assert_eq!(entries[0].vif_name, "bhaul-sta-24");
        assert_eq!(entries[1].vif_name, "bhaul-sta-5");
    }

    #[test]
    fn skips_malformed_tokens() {
        let entries = parse_list("phy0 :x phy1:bhaul-sta-5 ");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].vif_name, "bhaul-sta-5");
    }

    #[test]
    fn extra_fields_are_dropped() {
        let entries = parse_list("phy0:bhaul-sta-24:extra");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phy_name, "phy0");
        assert_eq!(entries[0].vif_name, "bhaul-sta-24");
    }

    #[test]
    fn gre_naming() {
        assert_eq!(gre_name_for("bhaul-sta-24"), "g-bhaul-sta-24");
    }
}
