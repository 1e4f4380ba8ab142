//! Domain detection and expected-factor checklists.

use serde::Serialize;

use crate::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    ProductLaunch,
    Pricing,
    Hiring,
    Investment,
    General,
}

impl Domain {
    /// Domains that can be detected, in tie-break order.
    const DETECTABLE: [Domain; 4] = [
        Domain::ProductLaunch,
        Domain::Pricing,
        Domain::Hiring,
        Domain::Investment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::ProductLaunch => "product_launch",
            Domain::Pricing => "pricing",
            Domain::Hiring => "hiring",
            Domain::Investment => "investment",
            Domain::General => "general",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Domain::ProductLaunch => &["launch", "product", "release", "go-to-market", "beta", "ship"],
            Domain::Pricing => &["price", "pricing", "discount", "subscription", "tier", "premium"],
            Domain::Hiring => &["hire", "hiring", "recruit", "candidate", "headcount", "talent"],
            Domain::Investment => &["invest", "funding", "capital", "roi", "acquisition", "portfolio"],
            Domain::General => &[],
        }
    }

    fn checklist(&self) -> &'static [ExpectedFactor] {
        match self {
            Domain::ProductLaunch => PRODUCT_LAUNCH,
            Domain::Pricing => PRICING,
            Domain::Hiring => HIRING,
            Domain::Investment => INVESTMENT,
            Domain::General => GENERAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Critical,
    Recommended,
    Optional,
}

impl Importance {
    pub fn weight(&self) -> u32 {
        match self {
            Importance::Critical => 3,
            Importance::Recommended => 2,
            Importance::Optional => 1,
        }
    }
}

/// A factor a well-formed model in a domain usually has.
#[derive(Debug)]
struct ExpectedFactor {
    name: &'static str,
    keywords: &'static [&'static str],
    importance: Importance,
    suggestion: &'static str,
}

const fn expect(
    name: &'static str,
    keywords: &'static [&'static str],
    importance: Importance,
    suggestion: &'static str,
) -> ExpectedFactor {
    ExpectedFactor {
        name,
        keywords,
        importance,
        suggestion,
    }
}

const PRODUCT_LAUNCH: &[ExpectedFactor] = &[
    expect("competition", &["competit", "rival"], Importance::Critical, "Add a factor for competitor response to the launch"),
    expect("timing", &["timing", "launch date", "season", "window"], Importance::Critical, "Add a factor for launch timing or market window"),
    expect("resources", &["budget", "resource", "staff"], Importance::Recommended, "Add a factor for the budget or people the launch needs"),
    expect("product-market fit", &["demand", "fit", "adoption", "customer need"], Importance::Critical, "Add a factor for customer demand or product-market fit"),
    expect("readiness", &["readiness", "ready", "quality", "testing"], Importance::Recommended, "Add a factor for product readiness or quality"),
    expect("support capacity", &["support", "customer service", "capacity"], Importance::Optional, "Consider a factor for support capacity after launch"),
];

const PRICING: &[ExpectedFactor] = &[
    expect("competitor pricing", &["competit", "rival", "market price"], Importance::Critical, "Add a factor for competitor prices"),
    expect("demand elasticity", &["demand", "elasticity", "volume"], Importance::Critical, "Add a factor for how demand responds to price"),
    expect("unit cost", &["cost", "margin"], Importance::Critical, "Add a factor for unit cost or margin"),
    expect("customer segments", &["segment", "customer"], Importance::Recommended, "Add a factor for the customer segments affected"),
    expect("churn", &["churn", "retention"], Importance::Recommended, "Add a factor for churn or retention"),
    expect("brand perception", &["brand", "perception"], Importance::Optional, "Consider a factor for brand perception"),
];

const HIRING: &[ExpectedFactor] = &[
    expect("compensation budget", &["budget", "salary", "compensation"], Importance::Critical, "Add a factor for the compensation budget"),
    expect("skills gap", &["skill", "capability", "expertise"], Importance::Critical, "Add a factor for the skills the team is missing"),
    expect("time to hire", &["time to hire", "hiring time", "pipeline"], Importance::Recommended, "Add a factor for how long hiring takes"),
    expect("onboarding", &["onboarding", "ramp"], Importance::Recommended, "Add a factor for onboarding or ramp-up time"),
    expect("team capacity", &["capacity", "workload"], Importance::Recommended, "Add a factor for current team capacity"),
    expect("culture fit", &["culture"], Importance::Optional, "Consider a factor for culture fit"),
];

const INVESTMENT: &[ExpectedFactor] = &[
    expect("expected return", &["return", "roi", "revenue"], Importance::Critical, "Add a factor for the expected return"),
    expect("risk", &["risk", "volatility", "uncertainty"], Importance::Critical, "Add a factor for downside risk"),
    expect("capital required", &["capital", "cost", "outlay"], Importance::Critical, "Add a factor for the capital required"),
    expect("time horizon", &["horizon", "timeline", "payback"], Importance::Recommended, "Add a factor for the time horizon or payback period"),
    expect("opportunity cost", &["opportunity", "alternative"], Importance::Recommended, "Add a factor for what else the money could fund"),
    expect("exit options", &["exit", "liquidity"], Importance::Optional, "Consider a factor for exit options or liquidity"),
];

const GENERAL: &[ExpectedFactor] = &[
    expect("cost", &["cost", "budget", "spend"], Importance::Critical, "Add a factor for cost"),
    expect("risk", &["risk", "uncertainty"], Importance::Critical, "Add a factor for risk"),
    expect("timing", &["time", "timing", "deadline"], Importance::Recommended, "Add a factor for timing"),
    expect("stakeholders", &["stakeholder", "customer", "team"], Importance::Recommended, "Add a factor for the people affected"),
    expect("external conditions", &["market", "economy", "competit"], Importance::Optional, "Consider a factor for external conditions"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingFactor {
    pub name: String,
    pub importance: Importance,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainCompleteness {
    pub domain: Domain,
    pub present_factors: Vec<String>,
    pub missing_factors: Vec<MissingFactor>,
    /// Importance-weighted share of expected factors present, 0.0-1.0.
    pub completeness_score: f64,
}

pub fn analyze(brief: &str, graph: &Graph) -> DomainCompleteness {
    let labels: Vec<String> = graph
        .nodes
        .iter()
        .filter_map(|n| n.label.as_deref())
        .map(str::to_lowercase)
        .collect();
    let domain = detect_domain(brief, &labels);
    let label_words: Vec<Vec<String>> = labels.iter().map(|l| words(l)).collect();

    let mut present = Vec::new();
    let mut missing = Vec::new();
    let (mut earned, mut total) = (0u32, 0u32);
    for factor in domain.checklist() {
        total += factor.importance.weight();
        let found = label_words
            .iter()
            .any(|label| factor.keywords.iter().any(|k| mentions(label, k)));
        if found {
            earned += factor.importance.weight();
            present.push(factor.name.to_string());
        } else {
            missing.push(MissingFactor {
                name: factor.name.to_string(),
                importance: factor.importance,
                suggestion: factor.suggestion.to_string(),
            });
        }
    }

    let score = if total == 0 {
        1.0
    } else {
        round2(earned as f64 / total as f64)
    };

    DomainCompleteness {
        domain,
        present_factors: present,
        missing_factors: missing,
        completeness_score: score,
    }
}

/// Pick the domain by summed keyword hits over the brief and the labels.
/// Ties go to the brief's own winner, then to declaration order.
pub fn detect_domain(brief: &str, labels: &[String]) -> Domain {
    let brief = brief.to_lowercase();
    let brief_hits: Vec<usize> = Domain::DETECTABLE
        .iter()
        .map(|d| hits(d, std::iter::once(brief.as_str())))
        .collect();
    let label_hits: Vec<usize> = Domain::DETECTABLE
        .iter()
        .map(|d| hits(d, labels.iter().map(String::as_str)))
        .collect();
    let totals: Vec<usize> = brief_hits
        .iter()
        .zip(&label_hits)
        .map(|(b, l)| b + l)
        .collect();

    let best = totals.iter().copied().max().unwrap_or(0);
    if best == 0 {
        return Domain::General;
    }

    let brief_winner = argmax(&brief_hits);
    if let Some(i) = brief_winner {
        if totals[i] == best {
            return Domain::DETECTABLE[i];
        }
    }
    argmax(&totals)
        .map(|i| Domain::DETECTABLE[i])
        .unwrap_or(Domain::General)
}

fn hits<'a>(domain: &Domain, texts: impl Iterator<Item = &'a str>) -> usize {
    texts
        .map(|text| {
            let text = words(text);
            domain.keywords().iter().filter(|k| mentions(&text, k)).count()
        })
        .sum()
}

/// Lowercase alphanumeric words of `text`.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether the words of `keyword` appear consecutively in `text`, each one
/// at the start of a word. Keywords may be stems (`competit`) but never
/// match inside a word (`fit` is not in `profit`).
fn mentions(text: &[String], keyword: &str) -> bool {
    let key = words(keyword);
    if key.is_empty() || key.len() > text.len() {
        return false;
    }
    text.windows(key.len()).any(|window| {
        window
            .iter()
            .zip(&key)
            .all(|(word, k)| word.starts_with(k.as_str()))
    })
}

/// Index of the first maximum, if it is non-zero.
fn argmax(values: &[usize]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, v) in values.iter().enumerate() {
        if *v > 0 && best.map_or(true, |b| *v > values[b]) {
            best = Some(i);
        }
    }
    best
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
