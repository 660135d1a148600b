//! Receipt heuristics — stateless scoring and flagging of emails.
//!
//! Everything here is a pure function of `(subject, body, sender)` plus
//! construction-time configuration (the monitored accounts' own addresses
//! and the forwarding target). No database access; the store-aware layer
//! lives in `resolver.rs`.
//!
//! Decision order for `is_receipt`:
//! 1. replies/forwards are never receipts
//! 2. strong receipt indicators accept (they beat the promotional filter)
//! 3. promotional mail rejects
//! 4. shipping-only notifications reject
//! 5. transactional score >= 3 accepts
//! 6. known transactional sender + confirmation language accepts
//! 7. everything else rejects

use regex::Regex;
use rust_decimal::Decimal;

use crate::pipeline::types::EmailMessage;

/// Subjects that open like a reply or a forward.
const REPLY_FORWARD: &str = r"(?i)^(re|fwd?|forward)\s*:|^\[fwd\]|^\(fwd\)";

/// Carrier and shipping-desk sender fragments.
const SHIPPING_SENDERS: &[&str] = &[
    r"shipment-tracking@amazon\.com",
    r"ship-confirm@amazon\.com",
    r"shipping@amazon\.com",
    r"delivery@amazon\.com",
    r"tracking@amazon\.com",
    r"shipment@amazon\.com",
    r"logistics@amazon\.com",
    r"fulfillment@amazon\.com",
    r"shipping-",
    r"delivery-",
    r"tracking-",
    r"shipment-",
    r"tracking@ups\.com",
    r"delivery@fedex\.com",
    r"tracking@usps\.com",
    r"shipment@dhl\.com",
];

/// Shipping-status language in subject or body.
const SHIPPING_LANGUAGE: &[&str] = &[
    r"your\s+.*\s+(has\s+)?shipped",
    r"shipped\s+today",
    r"out\s+for\s+delivery",
    r"delivered",
    r"delivery\s+update",
    r"package\s+delivered",
    r"package\s+update",
    r"shipment\s+notification",
    r"tracking\s+information",
    r"track\s+your\s+package",
    r"delivery\s+notification",
    r"shipment\s+delivered",
    r"order.*shipped",
    r"item.*shipped",
    r"package.*shipped",
    r"delivery\s+attempt",
    r"delivery\s+rescheduled",
    r"delivery\s+delayed",
    r"package\s+is\s+on\s+the\s+way",
    r"arriving\s+today",
    r"arriving\s+tomorrow",
    r"expected\s+delivery",
    r"estimated\s+delivery",
    r"ups\s+delivery",
    r"fedex\s+delivery",
    r"usps\s+delivery",
    r"amazon\s+delivery",
    r"dhl\s+delivery",
    r"amazon.*shipment",
    r"preparing\s+to\s+ship",
    r"now\s+shipped",
    r"has\s+been\s+shipped",
    r"will\s+arrive",
];

/// Purchase evidence that rescues a shipping email from exclusion.
const PURCHASE_INDICATORS: &[&str] = &[
    r"order\s+confirmation",
    r"purchase\s+confirmation",
    r"payment\s+confirmation",
    r"receipt",
    r"invoice",
    r"charged",
    r"payment\s+received",
    r"total.*\$\d+",
    r"amount.*\$\d+",
    r"order\s+total",
    r"subtotal",
    r"tax.*\$\d+",
    r"order\s+placed",
    r"thank\s+you\s+for.*order",
];

/// Literal keywords that mark marketing mail. Checked against subject and
/// body independently, as substrings.
const PROMOTIONAL_KEYWORDS: &[&str] = &[
    "sale",
    "discount",
    "coupon",
    "deal",
    "deals",
    "offer",
    "promotion",
    "promo",
    "save",
    "savings",
    "off",
    "clearance",
    "limited time",
    "hurry",
    "newsletter",
    "weekly ad",
    "special offer",
    "flash sale",
    "free shipping",
    "member exclusive",
    "subscriber",
    "unsubscribe",
    "marketing",
    "browse",
    "shop now",
    "check out",
    "new arrivals",
    "trending",
    "bestseller",
    "featured",
    "recommended",
    "catalog",
    "circular",
    "black friday",
    "cyber monday",
    "holiday sale",
    "back to school",
    "rewards program",
    "loyalty",
    "points earned",
    "cashback earned",
    "gift card",
    "sweepstakes",
    "contest",
    "giveaway",
    "win",
    "personalized",
    "just for you",
    "based on your",
    "you might like",
    "weekly digest",
    "daily digest",
    "roundup",
    "this week",
    "new releases",
    "best deals",
    "top deals",
    "hot deals",
    "price drop",
    "discounted",
    "on sale",
    "reduced price",
    "lowest price",
    "price alert",
    "wishlist",
    "watch list",
    "compare prices",
    "deal alert",
    "digest",
    "update",
    "news",
    "updates",
    "latest",
    "recent",
    "weekly",
    "monthly",
    "daily",
    "edition",
    "issue",
    "curated",
    "handpicked",
    "selected",
    "picks",
    "discover",
    "explore",
    "find",
    "search",
    "view all",
    "see more",
    "learn more",
    "read more",
    "get started",
    "sign up",
    "join",
    "register",
    "download",
    "try",
    "expires",
    "ending",
    "last chance",
    "final",
    "closing",
    "while supplies last",
    "limited quantity",
    "almost gone",
];

/// Marketing phrasing that the keyword list misses.
const MARKETING_PATTERNS: &[&str] = &[
    r"\d+%\s*off",
    r"save\s*\$\d+",
    r"free\s*shipping",
    r"limited\s*time",
    r"act\s*now",
    r"shop\s*now",
    r"don't\s*miss",
    r"hurry",
    r"ends\s*(soon|today)",
    r"check\s*this\s*week",
    r"new\s*discounts",
    r"best\s*deals",
    r"weekly\s*digest",
    r"\+\d+\s*this\s*week",
    r"deals?\s*weekly",
    r"price\s*drop",
    r"now\s*\$\d+",
];

/// Bulk-mail tracking infrastructure, looked for in the body only.
const TRACKING_PATTERNS: &[&str] = &[
    r"awstrack\.me",
    r"click\.",
    r"track\.",
    r"utm_",
    r"newsletter",
    r"unsubscribe",
];

/// Deal-aggregator fingerprints, looked for in sender, subject, and body.
const DEALS_PATTERNS: &[&str] = &[
    r"deals?\s*net",
    r"deals?\s*com",
    r"bargain",
    r"slickdeals",
    r"reddit.*deals",
    r"steam.*sale",
    r"game.*deals",
];

/// Keywords that on their own strongly suggest a receipt.
const STRONG_KEYWORDS: &[&str] = &[
    "receipt",
    "invoice",
    "order confirmation",
    "payment confirmation",
    "purchase confirmation",
    "order complete",
    "payment received",
    "order summary",
    "order placed",
    "billing statement",
    "account statement",
    "thank you for your order",
    "order total",
    "amount charged",
    "subscribe & save",
    "subscription order",
    "ordered",
    "ordered:",
    "renewal",
    "license plate renewal",
];

/// Interleaved forms of the strong keywords ("Order #123 Confirmation").
const STRONG_REGEX: &[&str] = &[
    r"order.*confirmation",
    r"payment.*confirmation",
    r"purchase.*confirmation",
];

/// Hard evidence a transaction actually happened.
const SUPPORTING_EVIDENCE: &[&str] = &[
    r"order\s*#?\s*[a-z0-9\-]{6,}",
    r"invoice\s*#?\s*[a-z0-9\-]{6,}",
    r"transaction\s*#?\s*[a-z0-9\-]{6,}",
    r"tracking\s*#?\s*[a-z0-9\-]{8,}",
    r"\$[0-9,]+\.[0-9]{2}",
    r"total:?\s*\$[0-9,]+\.[0-9]{2}",
    r"amount:?\s*\$[0-9,]+\.[0-9]{2}",
    r"paid:?\s*\$[0-9,]+\.[0-9]{2}",
    r"view your order",
    r"arriving (tomorrow|today|monday|tuesday|wednesday|thursday|friday|saturday|sunday)",
];

/// Weighted transactional indicators for `transactional_score`.
const SCORE_INDICATORS: &[(&str, u32)] = &[
    (r"order\s*#?\s*[a-z0-9\-]{6,}", 2),
    (r"\$[0-9,]+\.[0-9]{2}", 2),
    (r"thank\s*you\s*for\s*(your\s*)?(order|purchase)", 2),
    (r"invoice\s*#?\s*[a-z0-9\-]{6,}", 2),
    (r"transaction", 1),
    (r"payment", 1),
    (r"billing", 1),
    (r"statement", 1),
    (r"account\s*balance", 1),
    (r"due\s*date", 1),
    (r"autopay", 1),
    (r"direct\s*debit", 1),
];

/// Sender domains that reliably send transactional mail.
const KNOWN_RECEIPT_SENDERS: &[&str] = &[
    "amazon.com",
    "amazon.co",
    "amazonses.com",
    "auto-confirm@amazon.com",
    "order-update@amazon.com",
    "digital-no-reply@amazon.com",
    "payments-messages@amazon.com",
    "paypal.com",
    "paypal-communications.com",
    "stripe.com",
    "square.com",
    "apple.com",
    "itunes.com",
    "google.com",
    "googlepayments.com",
    "microsoft.com",
    "xbox.com",
    "uber.com",
    "lyft.com",
    "doordash.com",
    "grubhub.com",
    "instacart.com",
    "shipt.com",
];

/// Generic confirmation language for the known-sender path.
const CONFIRMATION_PATTERNS: &[&str] = &[
    r"confirmation",
    r"receipt",
    r"order\s*#",
    r"invoice",
    r"payment",
    r"charged",
    r"bill",
    r"statement",
    r"\$[0-9,]+\.[0-9]{2}",
];

/// Ordered sender-fragment → category table. First match wins.
const CATEGORY_TABLE: &[(&[&str], &str)] = &[
    (&["amazon", "aws"], "amazon"),
    (&["uber", "lyft"], "transportation"),
    (&["doordash", "grubhub", "ubereats"], "food-delivery"),
    (&["starbucks", "mcdonalds", "subway"], "restaurants"),
    (&["walmart", "target", "costco"], "retail"),
    (&["netflix", "spotify", "adobe"], "subscriptions"),
    (&["paypal", "venmo", "square"], "payments"),
    (&["att", "verizon", "comcast", "xfinity", "spectrum"], "utilities"),
];

/// Compile a literal pattern list. Patterns are compile-time constants; a
/// failure here is a programming error.
fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
        .collect()
}

/// Stateless receipt classifier.
///
/// All regex sets are compiled once at construction; the per-email methods
/// allocate nothing beyond the combined text buffers.
pub struct ReceiptClassifier {
    /// Monitored accounts' own addresses — mail from them is a reply/forward.
    self_addresses: Vec<String>,
    /// The forwarding target also counts as "self".
    forward_target: Option<String>,

    reply_forward: Regex,
    shipping_senders: Vec<Regex>,
    shipping_language: Vec<Regex>,
    purchase_indicators: Vec<Regex>,
    marketing: Vec<Regex>,
    tracking: Vec<Regex>,
    deals: Vec<Regex>,
    strong_regex: Vec<Regex>,
    supporting_evidence: Vec<Regex>,
    score_indicators: Vec<(Regex, u32)>,
    confirmation: Vec<Regex>,
    dollar_amount: Regex,
}

impl ReceiptClassifier {
    /// Build a classifier for the given self addresses and forward target.
    pub fn new(self_addresses: Vec<String>, forward_target: Option<String>) -> Self {
        Self {
            self_addresses: self_addresses.iter().map(|s| s.to_lowercase()).collect(),
            forward_target: forward_target.map(|s| s.to_lowercase()),
            reply_forward: Regex::new(REPLY_FORWARD).unwrap(),
            shipping_senders: compile(SHIPPING_SENDERS),
            shipping_language: compile(SHIPPING_LANGUAGE),
            purchase_indicators: compile(PURCHASE_INDICATORS),
            marketing: compile(MARKETING_PATTERNS),
            tracking: compile(TRACKING_PATTERNS),
            deals: compile(DEALS_PATTERNS),
            strong_regex: compile(STRONG_REGEX),
            supporting_evidence: compile(SUPPORTING_EVIDENCE),
            score_indicators: SCORE_INDICATORS
                .iter()
                .map(|(p, w)| (Regex::new(&format!("(?i){p}")).unwrap(), *w))
                .collect(),
            confirmation: compile(CONFIRMATION_PATTERNS),
            dollar_amount: Regex::new(r"\$([0-9,]+\.[0-9]{2})").unwrap(),
        }
    }

    /// Is this a reply, a forward, or mail from one of our own addresses?
    pub fn is_reply_or_forward(&self, subject: &str, sender: &str) -> bool {
        if self.reply_forward.is_match(subject) {
            return true;
        }
        let sender = sender.to_lowercase();
        if let Some(ref target) = self.forward_target
            && sender.contains(target.as_str())
        {
            return true;
        }
        self.self_addresses.iter().any(|own| sender.contains(own))
    }

    /// Shipping-status mail that carries no purchase evidence.
    ///
    /// A shipment email that also mentions an order total, a charge, or a
    /// receipt is NOT excluded — it doubles as the receipt.
    pub fn is_shipping_notification(&self, subject: &str, body: &str, sender: &str) -> bool {
        if self.shipping_senders.iter().any(|r| r.is_match(sender)) {
            return true;
        }

        let text = format!("{subject} {body}");
        let has_shipping = self.shipping_language.iter().any(|r| r.is_match(&text));
        if !has_shipping {
            return false;
        }

        let has_purchase = self.purchase_indicators.iter().any(|r| r.is_match(&text));
        has_shipping && !has_purchase
    }

    /// Marketing/newsletter mail.
    ///
    /// Exemptions: "subscribe & save" / "subscription order" text is a
    /// purchase, and government senders (irs/dmv/gov) never count as
    /// promotional no matter what their subject says.
    pub fn is_promotional_email(&self, subject: &str, body: &str, sender: &str) -> bool {
        let text = format!("{subject} {body}");
        if text.contains("subscribe & save") || text.contains("subscription order") {
            return false;
        }

        if ["irs", "dmv", "gov"].iter().any(|gov| sender.contains(gov)) {
            return false;
        }

        if PROMOTIONAL_KEYWORDS
            .iter()
            .any(|kw| subject.contains(kw) || body.contains(kw))
        {
            return true;
        }

        if self
            .marketing
            .iter()
            .any(|r| r.is_match(subject) || r.is_match(body))
        {
            return true;
        }

        if self.tracking.iter().any(|r| r.is_match(body)) {
            return true;
        }

        self.deals
            .iter()
            .any(|r| r.is_match(sender) || r.is_match(subject) || r.is_match(body))
    }

    /// Strong receipt keyword plus hard supporting evidence.
    pub fn has_strong_receipt_indicators(&self, subject: &str, body: &str) -> bool {
        let has_keyword = STRONG_KEYWORDS
            .iter()
            .any(|kw| subject.contains(kw) || body.contains(kw));

        let text = format!("{subject} {body}");
        let has_regex = self.strong_regex.iter().any(|r| r.is_match(&text));

        if !(has_keyword || has_regex) {
            return false;
        }

        self.supporting_evidence.iter().any(|r| r.is_match(&text))
    }

    /// Weighted transactional score. No cap.
    pub fn transactional_score(&self, subject: &str, body: &str, sender: &str) -> u32 {
        let text = format!("{subject} {body} {sender}");
        let mut score: u32 = self
            .score_indicators
            .iter()
            .filter(|(r, _)| r.is_match(&text))
            .map(|(_, w)| w)
            .sum();

        if subject.starts_with("ordered:") {
            score += 1;
        }

        score
    }

    /// Substring membership in the fixed transactional-sender allow-list.
    pub fn is_known_receipt_sender(&self, sender: &str) -> bool {
        KNOWN_RECEIPT_SENDERS.iter().any(|s| sender.contains(s))
    }

    /// Any generic confirmation language present?
    pub fn has_transaction_confirmation(&self, subject: &str, body: &str) -> bool {
        self.confirmation
            .iter()
            .any(|r| r.is_match(subject) || r.is_match(body))
    }

    /// The full heuristic decision, no database involved.
    pub fn is_receipt(&self, email: &EmailMessage) -> bool {
        let subject = email.subject.to_lowercase();
        let body = email.body.to_lowercase();
        let sender = email.sender.to_lowercase();

        if self.is_reply_or_forward(&subject, &sender) {
            return false;
        }

        if self.has_strong_receipt_indicators(&subject, &body) {
            return true;
        }

        if self.is_promotional_email(&subject, &body, &sender) {
            return false;
        }

        if self.is_shipping_notification(&subject, &body, &sender) {
            return false;
        }

        if self.transactional_score(&subject, &body, &sender) >= 3 {
            return true;
        }

        if self.is_known_receipt_sender(&sender) && self.has_transaction_confirmation(&subject, &body)
        {
            return true;
        }

        false
    }

    /// First-match category for an accepted receipt.
    pub fn categorize(&self, email: &EmailMessage) -> &'static str {
        let sender = email.sender.to_lowercase();
        let subject = email.subject.to_lowercase();

        for (fragments, category) in CATEGORY_TABLE {
            if fragments.iter().any(|f| sender.contains(f)) {
                return category;
            }
        }

        if ["cvs", "walgreens", "pharmacy"]
            .iter()
            .any(|s| sender.contains(s))
            || subject.contains("prescription")
            || subject.contains("copay")
        {
            return "healthcare";
        }

        if ["irs", "dmv", "gov"].iter().any(|s| sender.contains(s))
            || subject.contains("tax")
            || subject.contains("license")
        {
            return "government";
        }

        "other"
    }

    /// Detection confidence in 0..=100. Promotional mail scores 0 outright.
    pub fn detection_confidence(&self, email: &EmailMessage) -> u32 {
        let subject = email.subject.to_lowercase();
        let body = email.body.to_lowercase();
        let sender = email.sender.to_lowercase();

        if self.is_promotional_email(&subject, &body, &sender) {
            return 0;
        }

        let mut confidence = 0;
        if self.has_strong_receipt_indicators(&subject, &body) {
            confidence += 40;
        }
        confidence += self.transactional_score(&subject, &body, &sender) * 10;
        if self.is_known_receipt_sender(&sender) {
            confidence += 20;
        }
        if self.has_transaction_confirmation(&subject, &body) {
            confidence += 10;
        }

        confidence.min(100)
    }

    /// Pull the first dollar amount out of the email text, if any.
    pub fn extract_amount(&self, email: &EmailMessage) -> Option<Decimal> {
        let text = format!("{} {}", email.subject, email.body);
        let captures = self.dollar_amount.captures(&text)?;
        captures[1].replace(',', "").parse().ok()
    }
}
