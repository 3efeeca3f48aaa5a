//! ABI based decoding of call inputs and revert payloads

use crate::error::{ClientError, ClientResult};

use ethers::abi::{self, Abi, Param, ParamType, Token};
use ethers::types::I256;
use ethers::utils::id;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Selector of `Error(string)`
pub const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// Selector of `Panic(uint256)`
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Call input matched to an ABI function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInput {
    pub signature: String,
    pub method: String,
    pub params: BTreeMap<String, String>,
}

/// Canonical `name(type,...)` signature
pub fn signature(name: &str, params: &[Param]) -> String {
    let types = params
        .iter()
        .map(|p| p.kind.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("{}({})", name, types)
}

/// Human readable revert reason from a revert payload
///
/// Understands `Error(string)`, `Panic(uint256)` and custom errors declared
/// in any of `abis`.
pub fn decode_revert_reason(data: &[u8], abis: &[(String, Arc<Abi>)]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let (selector, payload) = data.split_at(4);

    if selector == ERROR_SELECTOR {
        return match abi::decode(&[ParamType::String], payload).ok()?.pop()? {
            Token::String(reason) => Some(reason),
            _ => None,
        };
    }
    if selector == PANIC_SELECTOR {
        return match abi::decode(&[ParamType::Uint(256)], payload).ok()?.pop()? {
            Token::Uint(code) => Some(format!("Panic({:#x})", code)),
            _ => None,
        };
    }

    abis.iter()
        .flat_map(|(_, abi)| abi.errors.values().flatten())
        .find(|error| id(signature(&error.name, &error.inputs)) == selector)
        .and_then(|error| {
            let kinds: Vec<ParamType> = error.inputs.iter().map(|p| p.kind.clone()).collect();
            let tokens = abi::decode(&kinds, payload).ok()?;
            Some(format!("{}({})", error.name, render_tokens(&tokens)))
        })
}

/// Decode call data against the functions of `abi`
pub fn decode_input(abi: &Abi, input: &[u8]) -> ClientResult<DecodedInput> {
    if input.len() < 4 {
        return Err(ClientError::NoAbiMethod {
            address: None,
            selector: format!("0x{}", hex::encode(input)),
        });
    }
    let (selector, payload) = input.split_at(4);

    let function = abi
        .functions()
        .find(|f| f.short_signature() == selector)
        .ok_or_else(|| ClientError::NoAbiMethod {
            address: None,
            selector: format!("0x{}", hex::encode(selector)),
        })?;

    let tokens = function
        .decode_input(payload)
        .map_err(|e| ClientError::InputDecode(format!("{}: {}", function.name, e)))?;

    Ok(DecodedInput {
        signature: signature(&function.name, &function.inputs),
        method: function.name.clone(),
        params: named_values(function.inputs.iter().map(|p| p.name.as_str()), tokens),
    })
}

/// Pair tokens with parameter names, unnamed parameters become `arg<i>`
pub(crate) fn named_values<'a>(
    names: impl Iterator<Item = &'a str>,
    tokens: Vec<Token>,
) -> BTreeMap<String, String> {
    names
        .zip(tokens)
        .enumerate()
        .map(|(i, (name, token))| {
            let name = if name.is_empty() {
                format!("arg{}", i)
            } else {
                name.to_string()
            };
            (name, render_token(&token))
        })
        .collect()
}

fn render_tokens(tokens: &[Token]) -> String {
    tokens.iter().map(render_token).collect::<Vec<_>>().join(", ")
}

pub fn render_token(token: &Token) -> String {
    match token {
        Token::Address(a) => format!("{:?}", a),
        Token::Uint(v) => v.to_string(),
        Token::Int(v) => I256::from_raw(*v).to_string(),
        Token::Bool(b) => b.to_string(),
        Token::String(s) => s.clone(),
        Token::Bytes(b) | Token::FixedBytes(b) => format!("0x{}", hex::encode(b)),
        Token::Array(items) | Token::FixedArray(items) => format!("[{}]", render_tokens(items)),
        Token::Tuple(items) => format!("({})", render_tokens(items)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::types::{Address, U256};

    pub(crate) const VAULT_ABI: &str = r#"[
        {"type":"function","name":"withdraw","stateMutability":"nonpayable",
         "inputs":[{"name":"amount","type":"uint256"}],"outputs":[]},
        {"type":"event","name":"Withdrawn","anonymous":false,
         "inputs":[{"name":"account","type":"address","indexed":true},
                   {"name":"amount","type":"uint256","indexed":false}]},
        {"type":"error","name":"InsufficientBalance",
         "inputs":[{"name":"available","type":"uint256"},{"name":"required","type":"uint256"}]}
    ]"#;

    pub(crate) fn vault_abi() -> Arc<Abi> {
        Arc::new(serde_json::from_str(VAULT_ABI).unwrap())
    }

    pub(crate) fn insufficient_balance(available: u64, required: u64) -> Vec<u8> {
        let mut data = id("InsufficientBalance(uint256,uint256)").to_vec();
        data.extend(abi::encode(&[
            Token::Uint(U256::from(available)),
            Token::Uint(U256::from(required)),
        ]));
        data
    }

    pub(crate) fn withdraw_input(amount: u64) -> Vec<u8> {
        let mut data = id("withdraw(uint256)").to_vec();
        data.extend(abi::encode(&[Token::Uint(U256::from(amount))]));
        data
    }

    #[test]
    fn test_error_string_reason() {
        let mut data = ERROR_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::String("not owner".to_string())]));
        assert_eq!(decode_revert_reason(&data, &[]), Some("not owner".to_string()));
    }

    #[test]
    fn test_panic_reason() {
        let mut data = PANIC_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::Uint(U256::from(0x11))]));
        assert_eq!(decode_revert_reason(&data, &[]), Some("Panic(0x11)".to_string()));
    }

    #[test]
    fn test_custom_error_reason() {
        let abis = vec![("Vault".to_string(), vault_abi())];
        let reason = decode_revert_reason(&insufficient_balance(1, 5), &abis).unwrap();
        assert_eq!(reason, "InsufficientBalance(1, 5)");
        assert_eq!(decode_revert_reason(&insufficient_balance(1, 5), &[]), None);
        assert_eq!(decode_revert_reason(&[0x01], &abis), None);
    }

    #[test]
    fn test_decode_input() {
        let decoded = decode_input(&vault_abi(), &withdraw_input(42)).unwrap();
        assert_eq!(decoded.method, "withdraw");
        assert_eq!(decoded.signature, "withdraw(uint256)");
        assert_eq!(decoded.params.get("amount").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_unknown_selector() {
        let err = decode_input(&vault_abi(), &[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, ClientError::NoAbiMethod { ref selector, .. } if selector == "0xdeadbeef"));
    }

    #[test]
    fn test_render_tokens() {
        let minus_three = I256::from_dec_str("-3").unwrap();
        assert_eq!(render_token(&Token::Int(minus_three.into_raw())), "-3");
        assert_eq!(render_token(&Token::Bytes(vec![0xab])), "0xab");
        assert_eq!(
            render_token(&Token::Tuple(vec![Token::Bool(true), Token::Address(Address::zero())])),
            "(true, 0x0000000000000000000000000000000000000000)"
        );
    }
}
