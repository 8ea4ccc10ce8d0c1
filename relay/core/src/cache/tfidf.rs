//! TF-IDF Similarity Index
//!
//! Vector-space model over the cached texts, rebuilt from scratch whenever
//! the corpus changes.
//!
//! - Tokens: lowercase runs of two or more word characters
//! - English stop words removed before n-grams are formed
//! - Features: unigrams and bigrams, capped at `max_features` by corpus count
//! - Weights: raw term count times smoothed idf `ln((1 + n) / (1 + df)) + 1`
//! - Vectors are L2 normalized, so cosine similarity is a dot product
//!
//! Query terms outside the fitted vocabulary are ignored.

use std::collections::{HashMap, HashSet};

/// Sparse vector, sorted by feature index
type SparseVec = Vec<(usize, f64)>;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "across", "after", "afterwards", "again", "against", "all", "almost",
    "alone", "along", "already", "also", "although", "always", "am", "among", "amongst",
    "amoungst", "amount", "an", "and", "another", "any", "anyhow", "anyone", "anything", "anyway",
    "anywhere", "are", "around", "as", "at", "back", "be", "became", "because", "become",
    "becomes", "becoming", "been", "before", "beforehand", "behind", "being", "below", "beside",
    "besides", "between", "beyond", "bill", "both", "bottom", "but", "by", "call", "can",
    "cannot", "cant", "co", "con", "could", "couldnt", "cry", "de", "describe", "detail", "do",
    "done", "down", "due", "during", "each", "eg", "eight", "either", "eleven", "else",
    "elsewhere", "empty", "enough", "etc", "even", "ever", "every", "everyone", "everything",
    "everywhere", "except", "few", "fifteen", "fifty", "fill", "find", "fire", "first", "five",
    "for", "former", "formerly", "forty", "found", "four", "from", "front", "full", "further",
    "get", "give", "go", "had", "has", "hasnt", "have", "he", "hence", "her", "here",
    "hereafter", "hereby", "herein", "hereupon", "hers", "herself", "him", "himself", "his",
    "how", "however", "hundred", "i", "ie", "if", "in", "inc", "indeed", "interest", "into",
    "is", "it", "its", "itself", "keep", "last", "latter", "latterly", "least", "less", "ltd",
    "made", "many", "may", "me", "meanwhile", "might", "mill", "mine", "more", "moreover",
    "most", "mostly", "move", "much", "must", "my", "myself", "name", "namely", "neither",
    "never", "nevertheless", "next", "nine", "no", "nobody", "none", "noone", "nor", "not",
    "nothing", "now", "nowhere", "of", "off", "often", "on", "once", "one", "only", "onto",
    "or", "other", "others", "otherwise", "our", "ours", "ourselves", "out", "over", "own",
    "part", "per", "perhaps", "please", "put", "rather", "re", "same", "see", "seem", "seemed",
    "seeming", "seems", "serious", "several", "she", "should", "show", "side", "since",
    "sincere", "six", "sixty", "so", "some", "somehow", "someone", "something", "sometime",
    "sometimes", "somewhere", "still", "such", "system", "take", "ten", "than", "that", "the",
    "their", "them", "themselves", "then", "thence", "there", "thereafter", "thereby",
    "therefore", "therein", "thereupon", "these", "they", "thick", "thin", "third", "this",
    "those", "though", "three", "through", "throughout", "thru", "thus", "to", "together",
    "too", "top", "toward", "towards", "twelve", "twenty", "two", "un", "under", "until", "up",
    "upon", "us", "very", "via", "was", "we", "well", "were", "what", "whatever", "when",
    "whence", "whenever", "where", "whereafter", "whereas", "whereby", "wherein", "whereupon",
    "wherever", "whether", "which", "while", "whither", "who", "whoever", "whole", "whom",
    "whose", "why", "will", "with", "within", "without", "would", "yet", "you", "your", "yours",
    "yourself", "yourselves",
];

/// Split text into lowercase word tokens of two or more characters
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| word.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Unigram and bigram terms of `text`, stop words removed first
fn terms(text: &str, stop_words: &HashSet<&'static str>) -> Vec<String> {
    let words: Vec<String> = tokenize(text)
        .into_iter()
        .filter(|w| !stop_words.contains(w.as_str()))
        .collect();

    let mut terms = words.clone();
    terms.extend(words.windows(2).map(|pair| format!("{} {}", pair[0], pair[1])));
    terms
}

fn normalize(vector: &mut SparseVec) {
    let norm = vector.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for (_, w) in vector.iter_mut() {
            *w /= norm;
        }
    }
}

fn dot(a: &SparseVec, b: &SparseVec) -> f64 {
    let (mut i, mut j, mut sum) = (0, 0, 0.0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                sum += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    sum
}

/// Fitted TF-IDF model plus the vectors of the corpus it was fitted on
pub(crate) struct TfidfIndex {
    stop_words: HashSet<&'static str>,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    vectors: Vec<SparseVec>,
}

impl TfidfIndex {
    /// Empty index; matches nothing
    pub(crate) fn empty() -> Self {
        Self {
            stop_words: STOP_WORDS.iter().copied().collect(),
            vocabulary: HashMap::new(),
            idf: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Fit on `corpus`; vector `i` belongs to `corpus[i]`
    pub(crate) fn fit<S: AsRef<str>>(corpus: &[S], max_features: usize) -> Self {
        let mut index = Self::empty();
        if corpus.is_empty() {
            return index;
        }

        let documents: Vec<Vec<String>> = corpus
            .iter()
            .map(|text| terms(text.as_ref(), &index.stop_words))
            .collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut document_frequency: HashMap<&str, usize> = HashMap::new();
        for document in &documents {
            let mut seen = HashSet::new();
            for term in document {
                *counts.entry(term.as_str()).or_default() += 1;
                if seen.insert(term.as_str()) {
                    *document_frequency.entry(term.as_str()).or_default() += 1;
                }
            }
        }

        // Keep the most frequent terms; ties resolve alphabetically
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(max_features);
        let mut kept: Vec<&str> = ranked.into_iter().map(|(term, _)| term).collect();
        kept.sort_unstable();

        #[allow(clippy::cast_precision_loss)]
        let n = documents.len() as f64;
        index.idf = kept
            .iter()
            .map(|term| {
                #[allow(clippy::cast_precision_loss)]
                let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
                ((1.0 + n) / (1.0 + df)).ln() + 1.0
            })
            .collect();
        index.vocabulary = kept
            .iter()
            .enumerate()
            .map(|(i, term)| ((*term).to_string(), i))
            .collect();

        index.vectors = documents
            .iter()
            .map(|document| index.vectorize(document))
            .collect();
        index
    }

    fn vectorize(&self, terms: &[String]) -> SparseVec {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for term in terms {
            if let Some(&feature) = self.vocabulary.get(term) {
                *counts.entry(feature).or_default() += 1.0;
            }
        }
        let mut vector: SparseVec = counts
            .into_iter()
            .map(|(feature, tf)| (feature, tf * self.idf[feature]))
            .collect();
        vector.sort_unstable_by_key(|(feature, _)| *feature);
        normalize(&mut vector);
        vector
    }

    /// Number of indexed documents
    pub(crate) fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Cosine similarity of `text` against every indexed document
    pub(crate) fn similarities(&self, text: &str) -> Vec<f64> {
        let query = self.vectorize(&terms(text, &self.stop_words));
        self.vectors.iter().map(|doc| dot(&query, doc)).collect()
    }

    /// Most similar document and its similarity; the first one wins ties
    pub(crate) fn best_match(&self, text: &str) -> Option<(usize, f64)> {
        self.similarities(text)
            .into_iter()
            .enumerate()
            .fold(None, |best, (i, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((i, score)),
            })
    }
}
