//! Built-in and configured bridge lines
//!
//! Pure data lookup. Starting or stopping the matching transport proxy is
//! the supervisor's job, see [`crate::transport::TransportSupervisor`].

use super::BridgeMode;
use crate::config::BridgesConfig;

/// Default obfs4 bridges shipped with the client
const BUILTIN_OBFS4: &[&str] = &[
    "obfs4 192.95.36.142:443 CDF2E852BF539B82BD10E27E9115A31734E378C2 cert=qUVQ0srL1JI/vO6V6m/24anYXiJD3QP2HgzUKQtQ7GRqqUvs7P+tG43RtAqdhLOALP7DJQ iat-mode=1",
    "obfs4 37.218.245.14:38224 D9A82D2F9C2F65A18407B1D2B764F130847F8B5D cert=bjRaMrr1BRiAW8IE9U5z27fQaYgOhX1UCmOpg2pFpoMvo6ZgQMzLsaTzzQNTlm7hNcb+Sg iat-mode=0",
    "obfs4 85.31.186.98:443 011F2599C0E9B27EE74B353155E244813763C3E5 cert=ayq0XzCwhpdysn5o0EyDUbmSOx3X/oTEbzDMvczHOdBJKlvIdHHLJGkZARtT4dcBFArPPg iat-mode=0",
    "obfs4 85.31.186.26:443 91A6354697E6B02A386312F68D82CF86824D3606 cert=PBwr+S8JTVZo6MPdHnkTwXJPILWADLqfMGoVvhZClMq/Urndyd42BwX9YFJHZnBB3H0XCw iat-mode=0",
    "obfs4 193.11.166.194:27015 2D82C2E354D531A68469ADF7F878FA6060C6BACA cert=4TLQPJrTSaDffMK7Nbao6LC7G9OW/NHkUwIdjLSS3KYf0Nv4/nQiiI8dY2TcsQx01NniOg iat-mode=0",
    "obfs4 193.11.166.194:27020 86AC7B8D430DAC4117E9F42C9EAED18133863AAF cert=0LDeJH4JzMDtkJJrFphJCiPqKx7loozKN7VNfuukMGfHO0Z8OGdzHVkhVAOfo1mUdv9cMg iat-mode=0",
    "obfs4 193.11.166.194:27025 1AE2C08904527FEA90C4C4F8C1083EA59FBC6FAF cert=ItvYZzW5tn6v3G4UnQa6Qz04Npro6e81AP70YujmK/KXwDFPTs3aHXcHp4n8Vt6w/bv8cA iat-mode=0",
    "obfs4 209.148.46.65:443 74FAD13168806246602538555B5521A0383A1875 cert=ssH+9rP8dG2NLDN2XuFw63hIO/9MNNinLmxQDpVa+7kTOa9/m+tGWT1SmSYpQ9uTBGa6Hw iat-mode=0",
    "obfs4 146.57.248.225:22 10A6CD36A537FCE513A322361547444B393989F0 cert=K1gDtDAIcUfeLqbstggjIw2rtgIKqdIhUlHp82XRqNSq/mtAjp1BIC9vHKJ2FAEpGssTPw iat-mode=0",
    "obfs4 45.145.95.6:27015 C5B7CD6946FF10C5930575A3A8A7A7AE2E2D5F0F cert=TD7PbUO0/0k6xYHMPW3vJxICfkMZNdkRrb63Zhl5j9dW3iRGiCx0A7mPhe5T2EDzQ35+Zw iat-mode=0",
    "obfs4 51.222.13.177:80 5EDAC3B810E12B01F6FD8050D2FD3E277B289A08 cert=2uplIpLQ0q9+0qMFrK5pkaYRDOe460LL9WHBvatgkuRr/SL31wBOEupaMMJ6koRE6Ld0ew iat-mode=0",
];

/// Default snowflake bridge, reached through the domain-fronted broker
const BUILTIN_SNOWFLAKE: &[&str] = &[
    "snowflake 192.0.2.3:80 2B280B23E1107BB62ABFC40DDCC8824814F80A72 fingerprint=2B280B23E1107BB62ABFC40DDCC8824814F80A72 url=https://snowflake-broker.torproject.net.global.prod.fastly.net/ front=cdn.sstatic.net ice=stun:stun.l.google.com:19302,stun:stun.antisip.com:3478,stun:stun.bluesip.net:3478,stun:stun.dus.net:3478 utls-imitate=hellorandomizedalpn",
];

/// Bridge lines per transport mode
#[derive(Debug, Clone)]
pub struct BridgeCatalog {
    obfs4: Vec<String>,
    snowflake: Vec<String>,
}

impl BridgeCatalog {
    /// Catalog with the compiled-in bridge lines
    pub fn builtin() -> Self {
        Self {
            obfs4: BUILTIN_OBFS4.iter().map(|s| s.to_string()).collect(),
            snowflake: BUILTIN_SNOWFLAKE.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Built-in catalog with any configured overrides applied
    pub fn from_config(config: &BridgesConfig) -> Self {
        let mut catalog = Self::builtin();
        if let Some(obfs4) = &config.obfs4 {
            catalog.obfs4 = obfs4.clone();
        }
        if let Some(snowflake) = &config.snowflake {
            catalog.snowflake = snowflake.clone();
        }
        catalog
    }

    pub fn obfs4(&self) -> &[String] {
        &self.obfs4
    }

    pub fn snowflake(&self) -> &[String] {
        &self.snowflake
    }

    /// Bridge lines for a mode. Custom lines are taken as given.
    pub fn bridges_for(&self, mode: BridgeMode, custom: Option<&[String]>) -> Vec<String> {
        match mode {
            BridgeMode::None => Vec::new(),
            BridgeMode::Obfs4 => self.obfs4.clone(),
            BridgeMode::Snowflake => self.snowflake.clone(),
            BridgeMode::Custom => custom.map(|c| c.to_vec()).unwrap_or_default(),
        }
    }
}

/// Render bridge lines as daemon launch arguments
///
/// Each line becomes a `--Bridge <line>` pair; a non-empty list is followed
/// by `--UseBridges 1`.
pub fn bridges_as_args(bridges: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(bridges.len() * 2 + 2);
    for line in bridges {
        args.push("--Bridge".to_string());
        args.push(line.clone());
    }
    if !bridges.is_empty() {
        args.push("--UseBridges".to_string());
        args.push("1".to_string());
    }
    args
}

/// Render bridge lines as SETCONF key/value pairs, bridges first
pub fn bridges_as_conf(bridges: &[String]) -> Vec<(String, String)> {
    let mut conf: Vec<(String, String)> = bridges
        .iter()
        .map(|line| ("Bridge".to_string(), format!("\"{}\"", line)))
        .collect();
    let use_bridges = if bridges.is_empty() { "0" } else { "1" };
    conf.push(("UseBridges".to_string(), use_bridges.to_string()));
    conf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_modes() -> Vec<(BridgeMode, Option<Vec<String>>)> {
        vec![
            (BridgeMode::None, None),
            (BridgeMode::Obfs4, None),
            (BridgeMode::Snowflake, None),
            (BridgeMode::Custom, None),
            (BridgeMode::Custom, Some(vec![])),
            (
                BridgeMode::Custom,
                Some(vec!["obfs4 10.0.0.1:443 AAAA cert=x iat-mode=0".to_string()]),
            ),
        ]
    }

    #[test]
    fn test_args_are_pairs_with_trailing_use_bridges() {
        let catalog = BridgeCatalog::builtin();
        for (mode, custom) in all_modes() {
            let bridges = catalog.bridges_for(mode, custom.as_deref());
            let args = bridges_as_args(&bridges);

            if bridges.is_empty() {
                assert!(args.is_empty(), "{:?} should produce no args", mode);
                continue;
            }

            assert_eq!(args.len() % 2, 0);
            assert_eq!(args.len(), bridges.len() * 2 + 2);
            let (pairs, tail) = args.split_at(args.len() - 2);
            assert_eq!(tail, ["--UseBridges", "1"]);
            for (pair, line) in pairs.chunks(2).zip(&bridges) {
                assert_eq!(pair[0], "--Bridge");
                assert_eq!(&pair[1], line);
            }
        }
    }

    #[test]
    fn test_obfs4_uses_builtin_list() {
        let catalog = BridgeCatalog::builtin();
        let bridges = catalog.bridges_for(BridgeMode::Obfs4, None);
        assert_eq!(bridges.len(), BUILTIN_OBFS4.len());
        assert!(bridges.iter().all(|b| b.starts_with("obfs4 ")));
    }

    #[test]
    fn test_custom_without_list_is_empty() {
        let catalog = BridgeCatalog::builtin();
        assert!(catalog.bridges_for(BridgeMode::Custom, None).is_empty());
    }

    #[test]
    fn test_config_overrides_builtin() {
        let config = BridgesConfig {
            obfs4: Some(vec!["obfs4 10.1.1.1:80 BBBB cert=y iat-mode=0".to_string()]),
            ..BridgesConfig::default()
        };
        let catalog = BridgeCatalog::from_config(&config);
        assert_eq!(catalog.obfs4().len(), 1);
        assert_eq!(catalog.snowflake().len(), BUILTIN_SNOWFLAKE.len());
    }

    #[test]
    fn test_conf_form_quotes_and_orders_bridges_first() {
        let bridges = vec!["a 1".to_string(), "b 2".to_string()];
        let conf = bridges_as_conf(&bridges);
        assert_eq!(
            conf,
            vec![
                ("Bridge".to_string(), "\"a 1\"".to_string()),
                ("Bridge".to_string(), "\"b 2\"".to_string()),
                ("UseBridges".to_string(), "1".to_string()),
            ]
        );
        assert_eq!(
            bridges_as_conf(&[]),
            vec![("UseBridges".to_string(), "0".to_string())]
        );
    }
}
