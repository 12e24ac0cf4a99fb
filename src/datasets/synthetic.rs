//! A deterministic miniature location-tracking task. Two people move between
//! three places; each story is one movement sentence plus a "where is X"
//! query. Small enough that a few dozen updates reach near-zero loss, which
//! makes it the end-to-end fixture for the trainer.

use crate::configs::OutputFormat;

use super::{Answer, Bucket, Dataset, SentenceGraph, Story, Vocab};

const PEOPLE: [&str; 2] = ["mary", "john"];
const PLACES: [&str; 3] = ["kitchen", "garden", "office"];
const FILLER: [&str; 4] = ["went", "to", "where", "is"];

/// One story per (person, place) pair, all in a single bucket.
pub fn where_is_task(format: OutputFormat) -> Dataset {
    let words =
        Vocab::from_words(PEOPLE.iter().chain(PLACES.iter()).chain(FILLER.iter()).copied());
    let answers = Vocab::from_words(PLACES);
    let node_names = Vocab::from_words(PEOPLE.iter().chain(PLACES.iter()).copied());
    let edge_names = Vocab::from_words(["at"]);

    let went = words.index_of("went").unwrap();
    let to = words.index_of("to").unwrap();
    let where_ = words.index_of("where").unwrap();
    let is = words.index_of("is").unwrap();

    let node_count = node_names.len();
    let mut stories = Vec::new();
    for person in PEOPLE.iter() {
        for (l, place) in PLACES.iter().enumerate() {
            let person_w = words.index_of(person).unwrap();
            let place_w = words.index_of(place).unwrap();
            let person_n = node_names.index_of(person).unwrap();
            let place_n = node_names.index_of(place).unwrap();

            let answer = match format {
                OutputFormat::SingleWord => Answer::Word(l),
                OutputFormat::Sequence => Answer::Sequence(vec![l]),
                OutputFormat::NodeSelection => Answer::Node(place_n),
            };
            let mut exists = vec![0.0; node_count];
            exists[person_n] = 1.0;
            exists[place_n] = 1.0;
            stories.push(Story {
                sentences: vec![vec![person_w, went, to, place_w]],
                query: vec![where_, is, person_w],
                answer,
                graphs: Some(vec![SentenceGraph {
                    exists,
                    ids: (0..node_count).collect(),
                    edges: vec![(person_n, place_n, 1)],
                    focus: person_n,
                }]),
            });
        }
    }

    Dataset {
        words,
        answers,
        node_names,
        edge_names,
        new_nodes_per_iter: 0,
        answer_seq_len: 1,
        buckets: vec![Bucket { node_count, stories }],
    }
}
