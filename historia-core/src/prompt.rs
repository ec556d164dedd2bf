//! Prompt composition for segment and continuation calls.
//!
//! A prompt is one block of text: the fixed rules, the story's
//! configuration, the reader's decisions so far, the tail of the text
//! already written, and a task instruction for the current stage.

use crate::story::{Stage, Story, CHAPTER_LIMIT};

/// Section marker the model is asked to put before the three options.
pub const CHOICES_MARKER: &str = "[ESCOLHAS]";

const EMPTY_TEXT: &str = "(vazio)";

/// Prompt for generating the segment that follows `stage`.
pub fn segment_prompt(story: &Story, stage: Stage, context_chars: usize) -> String {
    let mut prompt = base_rules(story);
    push_choices(&mut prompt, story);
    push_context(&mut prompt, story, context_chars);
    prompt.push_str(segment_instruction(stage));
    prompt
}

/// Prompt for resuming the current text exactly where it stopped.
pub fn continuation_prompt(story: &Story, context_chars: usize) -> String {
    let mut prompt = base_rules(story);
    push_choices(&mut prompt, story);
    push_context(&mut prompt, story, context_chars);
    prompt.push_str(CONTINUATION_INSTRUCTION);
    if story.stage == Stage::PreConclusion {
        prompt.push_str(CONTINUATION_CHOICES);
    }
    prompt
}

fn base_rules(story: &Story) -> String {
    let config = &story.config;
    let pov = if config.first_person {
        "PRIMEIRA PESSOA (eu, meu, minha)"
    } else {
        "TERCEIRA PESSOA"
    };

    format!(
        "Você é um gerador de narrativa do HistorIA.
Regras inegociáveis:
- História fictícia para entretenimento.
- Respeite: Título, Premissa, Núcleos, Tom, Classificação e POV.
- Mantenha consistência e continuidade.
- Não ofereça explicações meta.
- Não mencione políticas, nem a palavra \"prompt\".
- Proibido pular etapas: o controlador externo decide quando pausar e quando pedir escolhas.
- Se o modo Primeira Pessoa estiver ativo, o narrador é o próprio protagonista.

Contexto fixo:
Título: {title}
Premissa: {premise}
Núcleos desejados: {nuclei}
Tom: {tone}
Classificação: {rating}
POV: {pov}
Capítulo atual: {chapter} de {limit}
",
        title = config.title,
        premise = config.premise,
        nuclei = config.nuclei,
        tone = config.tone,
        rating = config.age_rating,
        chapter = story.chapter,
        limit = CHAPTER_LIMIT,
    )
}

fn push_choices(prompt: &mut String, story: &Story) {
    if story.choices().is_empty() {
        return;
    }
    prompt.push_str("\nEscolhas do leitor até agora (respeite todas):\n");
    for record in story.choices() {
        prompt.push_str(&format!(
            "- Capítulo {}, pausa {}: {}\n",
            record.chapter, record.pause, record.choice
        ));
    }
}

fn push_context(prompt: &mut String, story: &Story, context_chars: usize) {
    let current = tail(&story.full_text, context_chars);
    let remaining = context_chars.saturating_sub(current.chars().count());

    if let Some(previous) = story.previous_text() {
        if remaining > 0 {
            prompt.push_str("\nResumo do capítulo anterior (trecho final):\n");
            prompt.push_str(tail(previous, remaining));
            prompt.push('\n');
        }
    }

    prompt.push_str("\nTexto acumulado até agora (use como continuidade, não repita):\n");
    if current.trim().is_empty() {
        prompt.push_str(EMPTY_TEXT);
    } else {
        prompt.push_str(current);
    }
    prompt.push_str("\n\n");
}

fn segment_instruction(stage: Stage) -> &'static str {
    match stage {
        Stage::Start => {
            "Tarefa: Escreva o INÍCIO do capítulo atual (aprox. metade do capítulo).
Ao final, gere exatamente 3 opções de escolha (curtas e claras), numeradas de 1 a 3.
Formato:
[TEXTO]

[ESCOLHAS]
1) ...
2) ...
3) ...
"
        }
        Stage::Middle => {
            "Tarefa: Continue a história do ponto atual até aproximadamente 90% do capítulo.
Ao final, gere exatamente 3 opções de escolha (curtas e claras), numeradas de 1 a 3.
Formato:
[TEXTO]

[ESCOLHAS]
1) ...
2) ...
3) ...
"
        }
        Stage::PreConclusion => {
            "Tarefa: Conclua o capítulo atual (finalize o arco do capítulo).
Não gere escolhas.
Formato:
[TEXTO]
"
        }
        Stage::Concluded => "Tarefa: Capítulo já concluído.\n",
    }
}

const CONTINUATION_INSTRUCTION: &str = "Tarefa: O texto acima foi interrompido. Continue EXATAMENTE de onde parou,
mesmo que seja no meio de uma frase.
Não repita, não resuma e não altere nada do que já foi escrito.
";

const CONTINUATION_CHOICES: &str = "Ao terminar o trecho, gere exatamente 3 opções de escolha (curtas e claras), numeradas de 1 a 3.
Formato:
[TEXTO]

[ESCOLHAS]
1) ...
2) ...
3) ...
";

/// The last `max_chars` characters of `text`, cut on a char boundary.
fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}
