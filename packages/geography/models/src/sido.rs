//! Korean province (`시도`) code utilities.
//!
//! Maps the two-digit administrative province codes that prefix every
//! `sig`, `emd` and `ri` code to their official and short names. Both the
//! legacy and the special self-governing codes are listed for provinces
//! that were re-coded (Gangwon, Jeonbuk).

/// Province codes currently or historically in use.
pub const SIDO_CODES: &[&str] = &[
    "11", "26", "27", "28", "29", "30", "31", "36", "41", "42", "43", "44", "45", "46", "47", "48",
    "50", "51", "52",
];

/// Maps a two-digit province code to the official Korean name.
///
/// Returns `"알 수 없음"` for unrecognized codes.
#[must_use]
pub fn sido_name(code: &str) -> &'static str {
    match code {
        "11" => "서울특별시",
        "26" => "부산광역시",
        "27" => "대구광역시",
        "28" => "인천광역시",
        "29" => "광주광역시",
        "30" => "대전광역시",
        "31" => "울산광역시",
        "36" => "세종특별자치시",
        "41" => "경기도",
        "42" => "강원도",
        "43" => "충청북도",
        "44" => "충청남도",
        "45" => "전라북도",
        "46" => "전라남도",
        "47" => "경상북도",
        "48" => "경상남도",
        "50" => "제주특별자치도",
        "51" => "강원특별자치도",
        "52" => "전북특별자치도",
        _ => "알 수 없음",
    }
}

/// Maps a two-digit province code to the short name used in addresses
/// and by the facility records (`sidoCdNm`).
///
/// Returns `"??"` for unrecognized codes.
#[must_use]
pub fn sido_short_name(code: &str) -> &'static str {
    match code {
        "11" => "서울",
        "26" => "부산",
        "27" => "대구",
        "28" => "인천",
        "29" => "광주",
        "30" => "대전",
        "31" => "울산",
        "36" => "세종",
        "41" => "경기",
        "42" | "51" => "강원",
        "43" => "충북",
        "44" => "충남",
        "45" | "52" => "전북",
        "46" => "전남",
        "47" => "경북",
        "48" => "경남",
        "50" => "제주",
        _ => "??",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_count() {
        assert_eq!(SIDO_CODES.len(), 19);
    }

    #[test]
    fn name_coverage() {
        for code in SIDO_CODES {
            assert_ne!(sido_name(code), "알 수 없음", "no name for code: {code}");
            assert_ne!(sido_short_name(code), "??", "no short name for code: {code}");
        }
    }

    #[test]
    fn unknown_code() {
        assert_eq!(sido_name("99"), "알 수 없음");
        assert_eq!(sido_short_name("99"), "??");
    }
}
